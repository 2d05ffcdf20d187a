//! Unit tests for the `prewarm` CLI binary implementation.

use super::*;
use prewarm::credentials::CREDENTIALS_PATH_ENV;
use prewarm::test_support::{EnvGuard, sample_config};
use rstest::rstest;
use tempfile::TempDir;

#[test]
fn gen_overrides_replace_route_and_project() {
    let mut config = sample_config();

    apply_gen_overrides(
        &mut config,
        GenCommand {
            route: Some(String::from("oss")),
            project_dir: Some(String::from("/srv/app")),
        },
    );

    assert_eq!(config.route, "oss");
    assert_eq!(config.project_dir, "/srv/app");
}

#[test]
fn absent_gen_overrides_keep_configuration() {
    let mut config = sample_config();

    apply_gen_overrides(&mut config, GenCommand::default());

    assert_eq!(config, sample_config());
}

#[test]
fn enable_overrides_name_the_target() {
    let mut config = sample_config();

    apply_enable_overrides(
        &mut config,
        EnableCommand {
            service: Some(String::from("prod")),
            function: Some(String::from("api")),
        },
    );

    let target = config.quickstart_target().expect("target");
    assert_eq!(target.service, "prod");
    assert_eq!(target.function, "api");
}

#[rstest]
#[case(300, 600, 600)]
#[case(900, 60, 900)]
fn client_timeout_covers_the_longest_helper_timeout(
    #[case] timeout_secs: u32,
    #[case] init_timeout_secs: u32,
    #[case] expected: u64,
) {
    let config = PipelineConfig {
        timeout_secs,
        init_timeout_secs,
        ..sample_config()
    };

    let settings = fc_settings(&config, Credentials::new("1234", "ak", "sk"));

    assert_eq!(settings.timeout, Duration::from_secs(expected));
    assert_eq!(settings.base_url(), "https://1234.cn-hangzhou.fc.aliyuncs.com");
}

#[test]
fn explicit_credentials_skip_the_store() {
    let credentials = resolve_credentials(&sample_config()).expect("credentials");

    assert_eq!(credentials, Credentials::new("1234", "ak", "sk"));
}

#[tokio::test]
async fn profile_store_supplies_missing_credentials() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("credentials.toml");
    std::fs::write(
        &path,
        "[staging]\naccount_id = \"42\"\naccess_key_id = \"id\"\naccess_key_secret = \"secret\"\n",
    )
    .expect("write store");
    let _guard = EnvGuard::set_var(CREDENTIALS_PATH_ENV, path.to_str().expect("utf8")).await;
    let config = PipelineConfig {
        account_id: None,
        profile: Some(String::from("staging")),
        ..sample_config()
    };

    let credentials = resolve_credentials(&config).expect("credentials");

    assert_eq!(credentials, Credentials::new("42", "id", "secret"));
}

#[tokio::test]
async fn empty_store_is_rejected_with_guidance() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("missing.toml");
    let _guard = EnvGuard::set_var(CREDENTIALS_PATH_ENV, path.to_str().expect("utf8")).await;
    let config = PipelineConfig {
        access_key_secret: None,
        ..sample_config()
    };

    let err = resolve_credentials(&config).expect_err("incomplete credentials");

    assert!(
        matches!(err, CliError::Credentials(ref message) if message.contains("PREWARM_ACCESS_KEY_ID")),
        "unexpected error: {err}"
    );
}

#[test]
fn write_error_writes_cli_error() {
    let mut buf = Vec::new();
    let err = CliError::Credentials(String::from("no store"));

    write_error(&mut buf, &err);

    let rendered = String::from_utf8(buf).expect("utf8");
    assert_eq!(rendered, "credential error: no store\n");
}
