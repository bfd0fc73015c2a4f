/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Minor Duet services like version.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

/// The crate version baked in at compile time, `major.minor.patch[-build]`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current Duet version.
#[derive(ToSchema, Deserialize, Serialize, Debug, PartialEq, Eq)]
pub struct Version {
    major: u32,
    minor: u32,
    patch: u32,
    build: String,
}

/// GET `/v1/misc/version`: returns the current version of the server.
///
/// The version is returned as a json value with major, minor and patch as
/// integers and build as string (which may be empty).
#[utoipa::path(
        get,
        path = "/v1/misc/version",
        responses(
            (status = 200, description = "OK", body = Version),
            (status = 500, description = "unexpected internal server error")
        ),
)]
pub async fn duet_version() -> Response {
    match parse_version(VERSION) {
        Ok(version) => Json(version).into_response(),
        Err(e) => {
            error!(%e, "the compiled-in version string is malformed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Splits a `major.minor.patch-build` string into its [`Version`] parts.
/// Everything after the first dash is the build tag.
pub fn parse_version(raw: &str) -> Result<Version, String> {
    let (numbers, build) = match raw.split_once('-') {
        Some((numbers, build)) => (numbers, build.to_string()),
        None => (raw, String::new()),
    };

    let mut fields = numbers.split('.');
    let mut field = |name: &str| -> Result<u32, String> {
        fields
            .next()
            .ok_or_else(|| format!("version {raw:?} is missing its {name} number"))?
            .parse()
            .map_err(|_| format!("the {name} number of version {raw:?} is not numeric"))
    };

    let version = Version {
        major: field("major")?,
        minor: field("minor")?,
        patch: field("patch")?,
        build,
    };

    if fields.next().is_some() {
        return Err(format!("version {raw:?} has more than three numbers"));
    }

    Ok(version)
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use axum_test::TestServer;

    #[tokio::test]
    async fn the_endpoint_serves_the_compiled_version() {
        let router = Router::new().route("/v1/misc/version", get(duet_version));
        let server = TestServer::new(router).expect("cannot instantiate TestServer");

        let served = server.get("/v1/misc/version").await.json::<Version>();

        assert_eq!(served, parse_version(VERSION).expect("bad crate version"));
    }

    #[test]
    fn plain_versions_have_an_empty_build() {
        assert_eq!(
            parse_version("1.0.1"),
            Ok(Version {
                major: 1,
                minor: 0,
                patch: 1,
                build: String::new(),
            })
        )
    }

    #[test]
    fn everything_after_the_first_dash_is_the_build() {
        assert_eq!(
            parse_version("1.0.1-86_64-special-patch"),
            Ok(Version {
                major: 1,
                minor: 0,
                patch: 1,
                build: "86_64-special-patch".to_string(),
            })
        )
    }

    #[test]
    fn short_versions_are_rejected() {
        assert_eq!(
            parse_version("1.0"),
            Err("version \"1.0\" is missing its patch number".to_string())
        )
    }

    #[test]
    fn long_versions_are_rejected() {
        assert_eq!(
            parse_version("1.0.1.2"),
            Err("version \"1.0.1.2\" has more than three numbers".to_string())
        )
    }

    #[test]
    fn non_numeric_fields_are_rejected() {
        assert_eq!(
            parse_version("t.0.1"),
            Err("the major number of version \"t.0.1\" is not numeric".to_string())
        );
        assert_eq!(
            parse_version("1.0.x"),
            Err("the patch number of version \"1.0.x\" is not numeric".to_string())
        );
    }
}
