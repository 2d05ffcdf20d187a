//! Unit tests for the Function Compute client.

use std::collections::BTreeMap;
use std::time::Duration;

use rstest::rstest;
use serde_json::json;

use super::types::{AliasPage, ApiErrorBody, TriggerPage};
use super::*;
use crate::platform::{FunctionCode, LogConfig, NasConfig, NasMountPoint, VpcConfig};

fn settings(endpoint: Option<&str>) -> FcSettings {
    FcSettings {
        region: String::from("cn-hangzhou"),
        endpoint: endpoint.map(str::to_owned),
        credentials: Credentials::new("1234", "ak", "sk"),
        timeout: Duration::from_secs(30),
    }
}

fn function_spec(code: FunctionCode) -> FunctionSpec {
    FunctionSpec {
        name: String::from("trace-dump-func-abc"),
        handler: String::from("index.handler"),
        runtime: String::from("python3"),
        memory_mb: 1024,
        timeout_secs: 600,
        initializer: None,
        initialization_timeout_secs: 600,
        instance_type: String::from("e1"),
        environment: BTreeMap::from([(String::from("SRPATH"), String::from("/tmp/x"))]),
        code,
    }
}

#[rstest]
#[case(None, "https://1234.cn-hangzhou.fc.aliyuncs.com")]
#[case(Some("1234.cn-shanghai.fc.aliyuncs.com/"), "https://1234.cn-shanghai.fc.aliyuncs.com")]
#[case(Some(" http://127.0.0.1:9000 "), "http://127.0.0.1:9000")]
#[case(Some("  "), "https://1234.cn-hangzhou.fc.aliyuncs.com")]
fn base_url_follows_endpoint_override(#[case] endpoint: Option<&str>, #[case] expected: &str) {
    assert_eq!(settings(endpoint).base_url(), expected);
}

#[test]
fn client_rejects_incomplete_credentials() {
    let mut incomplete = settings(None);
    incomplete.credentials = Credentials::new("1234", "", "sk");

    let err = FcClient::new(&incomplete).expect_err("missing key id");

    assert!(matches!(err, FcError::Config(_)));
}

#[test]
fn client_keeps_base_url() {
    let client = FcClient::new(&settings(None)).expect("client");
    assert_eq!(client.base_url(), "https://1234.cn-hangzhou.fc.aliyuncs.com");
}

#[test]
fn request_paths_are_versioned() {
    assert_eq!(services_path(), "/2016-08-15/services");
    assert_eq!(
        function_path("svc", "fn"),
        "/2016-08-15/services/svc/functions/fn"
    );
    assert_eq!(
        proxy_path("svc", "fn", "/action"),
        "/2016-08-15/proxy/svc/fn/action"
    );
}

#[test]
fn only_proxy_resources_gain_a_trailing_newline() {
    assert_eq!(
        signed_resource("/2016-08-15/proxy/svc/fn/invoke"),
        "/2016-08-15/proxy/svc/fn/invoke\n"
    );
    assert_eq!(
        signed_resource("/2016-08-15/services/svc"),
        "/2016-08-15/services/svc"
    );
}

#[test]
fn service_body_carries_optional_sections() {
    let spec = ServiceSpec {
        name: String::from("trace-dump-service-abc"),
        description: String::from("cache generation"),
        role: Some(String::from("acs:ram::1234:role/fc")),
        log: Some(LogConfig {
            project: String::from("proj"),
            logstore: String::from("store"),
        }),
        vpc: Some(VpcConfig {
            vpc_id: String::from("vpc-1"),
            vswitch_ids: vec![String::from("vsw-1")],
            security_group_id: String::from("sg-1"),
        }),
        nas: Some(NasConfig {
            user_id: 10003,
            group_id: 10003,
            mount_points: vec![NasMountPoint {
                server_addr: String::from("nas.example.com:/share"),
                mount_dir: String::from("/mnt/auto"),
            }],
        }),
    };

    let body = serde_json::to_value(types::CreateServiceBody::from(&spec)).expect("json");

    assert_eq!(
        body,
        json!({
            "serviceName": "trace-dump-service-abc",
            "description": "cache generation",
            "role": "acs:ram::1234:role/fc",
            "logConfig": { "project": "proj", "logstore": "store" },
            "vpcConfig": {
                "vpcId": "vpc-1",
                "vSwitchIds": ["vsw-1"],
                "securityGroupId": "sg-1"
            },
            "nasConfig": {
                "userId": 10003,
                "groupId": 10003,
                "mountPoints": [
                    { "serverAddr": "nas.example.com:/share", "mountDir": "/mnt/auto" }
                ]
            }
        })
    );
}

#[test]
fn bare_service_body_omits_absent_sections() {
    let spec = ServiceSpec {
        name: String::from("svc"),
        description: String::new(),
        role: None,
        log: None,
        vpc: None,
        nas: None,
    };

    let body = serde_json::to_value(types::CreateServiceBody::from(&spec)).expect("json");

    assert_eq!(body, json!({ "serviceName": "svc", "description": "" }));
}

#[test]
fn inline_code_is_sent_as_zip_file() {
    let spec = function_spec(FunctionCode::Inline {
        zip_base64: String::from("UEsDBA=="),
    });

    let body = serde_json::to_value(types::CreateFunctionBody::from(&spec)).expect("json");

    assert_eq!(body["code"], json!({ "zipFile": "UEsDBA==" }));
    assert_eq!(body["memorySize"], json!(1024));
    assert_eq!(body["initializationTimeout"], json!(600));
    assert_eq!(body["instanceType"], json!("e1"));
    assert_eq!(body["environmentVariables"], json!({ "SRPATH": "/tmp/x" }));
    assert!(body.get("initializer").is_none());
}

#[test]
fn object_storage_code_names_bucket_and_object() {
    let spec = function_spec(FunctionCode::ObjectStorage {
        bucket: String::from("tmp-acceleration-abc"),
        object: String::from("tmp-func.zip"),
    });

    let body = serde_json::to_value(types::CreateFunctionBody::from(&spec)).expect("json");

    assert_eq!(
        body["code"],
        json!({ "ossBucketName": "tmp-acceleration-abc", "ossObjectName": "tmp-func.zip" })
    );
}

#[test]
fn http_trigger_body_allows_anonymous_get_and_post() {
    let spec = TriggerSpec::http("trace-dump-trigger-abc");

    let body = serde_json::to_value(types::CreateTriggerBody::from(&spec)).expect("json");

    assert_eq!(body["triggerName"], json!("trace-dump-trigger-abc"));
    assert_eq!(body["triggerType"], json!("http"));
    assert_eq!(body["qualifier"], json!("LATEST"));
    assert_eq!(
        body["triggerConfig"],
        json!({ "authType": "anonymous", "methods": ["POST", "GET"] })
    );
}

#[test]
fn list_pages_yield_names_and_next_token() {
    let page: AliasPage = serde_json::from_value(json!({
        "aliases": [{ "aliasName": "prod" }, { "aliasName": "staging" }],
        "nextToken": "abc"
    }))
    .expect("page");

    assert_eq!(
        page.into_parts(),
        (vec![String::from("prod"), String::from("staging")], Some(String::from("abc")))
    );
}

#[test]
fn empty_next_token_ends_listing() {
    let page: TriggerPage = serde_json::from_value(json!({
        "triggers": [{ "triggerName": "http" }],
        "nextToken": ""
    }))
    .expect("page");

    assert_eq!(page.into_parts(), (vec![String::from("http")], None));
}

#[test]
fn missing_list_field_is_an_empty_page() {
    let page: TriggerPage = serde_json::from_value(json!({})).expect("page");
    assert_eq!(page.into_parts(), (Vec::new(), None));
}

#[test]
fn api_error_body_reads_platform_fields() {
    let body: ApiErrorBody = serde_json::from_str(
        r#"{"ErrorCode":"ServiceNotFound","ErrorMessage":"service 'x' does not exist"}"#,
    )
    .expect("error body");

    assert_eq!(body.code, "ServiceNotFound");
    assert_eq!(body.message, "service 'x' does not exist");
}

#[rstest]
#[case(404, true)]
#[case(409, false)]
#[case(500, false)]
fn only_404_counts_as_not_found(#[case] status: u16, #[case] expected: bool) {
    let err = FcError::Api {
        method: String::from("DELETE"),
        path: String::from("/2016-08-15/services/x"),
        status,
        code: String::new(),
        message: String::from("gone"),
    };

    assert_eq!(err.is_not_found(), expected);
}

#[test]
fn api_errors_render_method_path_and_code() {
    let err = FcError::Api {
        method: String::from("POST"),
        path: String::from("/2016-08-15/services"),
        status: 409,
        code: String::from("ServiceAlreadyExists"),
        message: String::from("exists"),
    };

    assert_eq!(
        err.to_string(),
        "POST /2016-08-15/services returned 409 ServiceAlreadyExists: exists"
    );
}
