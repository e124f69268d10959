//! Smoke tests against a running build service.
//!
//! Set `OBS_URL` (e.g. `http://localhost:3000`) to enable them; authenticated
//! checks additionally need `OSC_USER` and `OSC_PASSWORD` or `OSC_SSH_PUBKEY`.

use obs_http::{ClientConfig, ObsClient};

fn live_api_url() -> Option<String> {
    std::env::var("OBS_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
}

fn scratch_jar() -> tempfile::TempDir {
    tempfile::tempdir().expect("must create temp dir")
}

#[tokio::test]
async fn live_configuration_is_readable() {
    let Some(api_url) = live_api_url() else {
        eprintln!("skipping live test: OBS_URL is not set");
        return;
    };
    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("skipping live test: {err}");
            return;
        }
    };

    let jar = scratch_jar();
    let client = ObsClient::new(
        config
            .with_api_url(api_url)
            .with_cookie_jar(jar.path().join("cookiejar")),
    )
    .expect("valid client");

    let response = client
        .get("/configuration")
        .await
        .expect("configuration must be readable");
    let body = response.text();
    assert!(body.contains("<configuration"), "unexpected body: {body}");
}

#[tokio::test]
async fn live_unknown_project_is_not_found() {
    let Some(api_url) = live_api_url() else {
        eprintln!("skipping live test: OBS_URL is not set");
        return;
    };

    let jar = scratch_jar();
    let client = ObsClient::new(
        ClientConfig::public(api_url).with_cookie_jar(jar.path().join("cookiejar")),
    )
    .expect("valid client");

    let err = client
        .get("/source/this:project:does:not:exist/_meta")
        .await
        .expect_err("unknown project must fail");
    assert!(err.is_not_found(), "unexpected error: {err}");
}
