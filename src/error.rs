// Copyright (c) 2025 The LLUDP Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type for egress pipeline operations.

use strum_macros::EnumIter;

/// Egress pipeline error.
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// The operation completed without error.
    #[default]
    NoError,

    /// The packet's category has no throttle bucket or priority mapping on
    /// this client.
    UnknownCategory,

    /// The operation was attempted after the client circuit was shut down.
    ClosedConnection,

    /// The throttle update blob is malformed (wrong length).
    InvalidThrottleBlob,

    /// The configuration is invalid.
    InvalidConfig(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn error_display() {
        for err in Error::iter() {
            assert_eq!(format!("{}", err), format!("{:?}", err));
        }
    }

    #[test]
    fn error_source() {
        use std::error::Error;
        let e = super::Error::ClosedConnection;
        assert!(e.source().is_none());
    }
}
