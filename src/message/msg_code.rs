// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

/// The *class* of a CoAP message code.
#[derive(Debug, Copy, Eq, PartialEq, Clone)]
pub enum MsgCodeClass {
    /// Class for methods (0.xx).
    Method = 0,

    /// Class for successful responses (2.xx).
    Success = 2,

    /// Class for client error responses (4.xx).
    ClientError = 4,

    /// Class for server error responses (5.xx).
    ServerError = 5,
}

impl MsgCodeClass {
    /// Calculates the message code class from the given wire code, if recognised.
    pub fn try_from(x: u8) -> Option<MsgCodeClass> {
        match x {
            0 => Some(MsgCodeClass::Method),
            2 => Some(MsgCodeClass::Success),
            4 => Some(MsgCodeClass::ClientError),
            5 => Some(MsgCodeClass::ServerError),
            _ => None,
        }
    }

    /// True if the given message code falls in this class.
    pub fn contains(self, code: MsgCode) -> bool {
        let code_u8 = code as u8;
        code_u8 != 0 && (code_u8 >> 5) == self as u8
    }
}

/// A CoAP message code: a method (0.01..0.04), a response (2.xx..5.xx), or 0 (empty).
#[derive(Debug, Copy, Eq, PartialEq, Hash, Clone)]
pub enum MsgCode {
    /// Empty code. Used for pings, resets, and empty (separate-response) acknowledgements.
    Empty = 0x00,

    /// GET (0.01).
    MethodGet = 0x01,

    /// POST (0.02).
    MethodPost = 0x02,

    /// PUT (0.03).
    MethodPut = 0x03,

    /// DELETE (0.04).
    MethodDelete = 0x04,

    /// Created (2.01).
    SuccessCreated = 0x41,

    /// Deleted (2.02).
    SuccessDeleted = 0x42,

    /// Valid (2.03).
    SuccessValid = 0x43,

    /// Changed (2.04).
    SuccessChanged = 0x44,

    /// Content (2.05).
    SuccessContent = 0x45,

    /// Continue (2.31) — used for intermediate Block1 acknowledgements.
    SuccessContinue = 0x5F,

    /// Bad Request (4.00).
    ClientErrorBadRequest = 0x80,

    /// Unauthorized (4.01).
    ClientErrorUnauthorized = 0x81,

    /// Bad Option (4.02) — response to an unrecognised critical option.
    ClientErrorBadOption = 0x82,

    /// Forbidden (4.03).
    ClientErrorForbidden = 0x83,

    /// Not Found (4.04).
    ClientErrorNotFound = 0x84,

    /// Method Not Allowed (4.05).
    ClientErrorMethodNotAllowed = 0x85,

    /// Not Acceptable (4.06).
    ClientErrorNotAcceptable = 0x86,

    /// Request Entity Incomplete (4.08) — Block1 middle-block size mismatch.
    ClientErrorRequestEntityIncomplete = 0x88,

    /// Precondition Failed (4.12).
    ClientErrorPreconditionFailed = 0x8C,

    /// Request Entity Too Large (4.13) — assembly buffer overflow.
    ClientErrorRequestEntityTooLarge = 0x8D,

    /// Unsupported Content-Format (4.15).
    ClientErrorUnsupportedMediaType = 0x8F,

    /// Internal Server Error (5.00).
    ServerErrorInternalServerError = 0xA0,

    /// Not Implemented (5.01).
    ServerErrorNotImplemented = 0xA1,

    /// Bad Gateway (5.02).
    ServerErrorBadGateway = 0xA2,

    /// Service Unavailable (5.03).
    ServerErrorServiceUnavailable = 0xA3,

    /// Gateway Timeout (5.04).
    ServerErrorGatewayTimeout = 0xA4,
}

impl MsgCode {
    /// Tries to convert a wire byte into a `MsgCode`; `None` if unrecognised.
    pub fn try_from(x: u8) -> Option<MsgCode> {
        use MsgCode::*;
        match x {
            0x00 => Some(Empty),
            0x01 => Some(MethodGet),
            0x02 => Some(MethodPost),
            0x03 => Some(MethodPut),
            0x04 => Some(MethodDelete),

            0x41 => Some(SuccessCreated),
            0x42 => Some(SuccessDeleted),
            0x43 => Some(SuccessValid),
            0x44 => Some(SuccessChanged),
            0x45 => Some(SuccessContent),
            0x5F => Some(SuccessContinue),

            0x80 => Some(ClientErrorBadRequest),
            0x81 => Some(ClientErrorUnauthorized),
            0x82 => Some(ClientErrorBadOption),
            0x83 => Some(ClientErrorForbidden),
            0x84 => Some(ClientErrorNotFound),
            0x85 => Some(ClientErrorMethodNotAllowed),
            0x86 => Some(ClientErrorNotAcceptable),
            0x88 => Some(ClientErrorRequestEntityIncomplete),
            0x8C => Some(ClientErrorPreconditionFailed),
            0x8D => Some(ClientErrorRequestEntityTooLarge),
            0x8F => Some(ClientErrorUnsupportedMediaType),

            0xA0 => Some(ServerErrorInternalServerError),
            0xA1 => Some(ServerErrorNotImplemented),
            0xA2 => Some(ServerErrorBadGateway),
            0xA3 => Some(ServerErrorServiceUnavailable),
            0xA4 => Some(ServerErrorGatewayTimeout),

            _ => None,
        }
    }

    /// True if this is the empty code.
    pub fn is_empty(self) -> bool {
        self as u8 == 0
    }

    /// True if this code is a method (a request).
    pub fn is_method(self) -> bool {
        MsgCodeClass::Method.contains(self)
    }

    /// True if this code is a client error (4.xx).
    pub fn is_client_error(self) -> bool {
        MsgCodeClass::ClientError.contains(self)
    }

    /// True if this code is a server error (5.xx).
    pub fn is_server_error(self) -> bool {
        MsgCodeClass::ServerError.contains(self)
    }

    /// True if this code is any sort of error response.
    pub fn is_error(self) -> bool {
        self.is_client_error() || self.is_server_error()
    }

    /// True if this code is a success response (2.xx).
    pub fn is_success(self) -> bool {
        MsgCodeClass::Success.contains(self)
    }
}

impl Default for MsgCode {
    fn default() -> Self {
        MsgCode::Empty
    }
}

impl From<MsgCode> for u8 {
    fn from(code: MsgCode) -> Self {
        code as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert!(MsgCode::MethodGet.is_method());
        assert!(MsgCode::SuccessContent.is_success());
        assert!(MsgCode::ClientErrorBadOption.is_client_error());
        assert!(MsgCode::ServerErrorInternalServerError.is_server_error());
        assert!(MsgCode::ClientErrorNotFound.is_error());
    }

    #[test]
    fn wire_round_trip() {
        for code in [
            MsgCode::MethodGet,
            MsgCode::SuccessContent,
            MsgCode::SuccessContinue,
            MsgCode::ClientErrorBadOption,
            MsgCode::ClientErrorRequestEntityIncomplete,
            MsgCode::ClientErrorRequestEntityTooLarge,
        ] {
            let byte: u8 = code.into();
            assert_eq!(MsgCode::try_from(byte), Some(code));
        }
    }
}
