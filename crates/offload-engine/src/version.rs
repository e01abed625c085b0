// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Host/device compatibility version string.

pub const API_MAJOR: u32 = 1;
pub const API_MINOR: u32 = 3;
pub const API_PATCH: u32 = 0;

/// Returns `<major>.<minor>.<patch>.<build-id>`.
///
/// The first three components track the host API; the build id comes from
/// `OFFLOAD_BUILD_ID` at compile time and identifies the device program
/// the host was built against. A layout drift between the two surfaces as
/// a `CreateParamsMismatch` device code at configure time, not here.
pub fn api_version() -> String {
    let build_id = option_env!("OFFLOAD_BUILD_ID").unwrap_or("00000000");
    format!("{API_MAJOR}.{API_MINOR}.{API_PATCH}.{build_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_shape() {
        let v = api_version();
        assert_eq!(v.split('.').count(), 4);
        assert!(v.starts_with("1.3.0."));
    }
}
