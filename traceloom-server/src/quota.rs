// Copyright 2025 Traceloom Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Quota gate: the auth response carries the tenant's quota state, and a
//! tripped bit rejects ingestion before any work happens.

use crate::auth::AuthContext;
use crate::error::ApiError;

pub fn check(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.quota_exceeded {
        return Err(ApiError::QuotaExceeded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(quota_exceeded: bool) -> AuthContext {
        AuthContext {
            workspace_id: "ws".to_string(),
            workspace_name: "ws".to_string(),
            username: "user".to_string(),
            quota_exceeded,
            anonymous: false,
        }
    }

    #[test]
    fn tripped_bit_is_a_402() {
        assert!(check(&context(false)).is_ok());
        let err = check(&context(true)).unwrap_err();
        assert_eq!(err.to_string(), "Usage limit exceeded");
    }
}
