//! Wire types for the Function Compute REST API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::platform::{
    FunctionCode, FunctionSpec, LogConfig, NasConfig, NasMountPoint, ServiceSpec, TriggerSpec,
    VpcConfig,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateServiceBody<'a> {
    service_name: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_config: Option<LogConfigBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vpc_config: Option<VpcConfigBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nas_config: Option<NasConfigBody<'a>>,
}

impl<'a> From<&'a ServiceSpec> for CreateServiceBody<'a> {
    fn from(spec: &'a ServiceSpec) -> Self {
        Self {
            service_name: &spec.name,
            description: &spec.description,
            role: spec.role.as_deref(),
            log_config: spec.log.as_ref().map(LogConfigBody::from),
            vpc_config: spec.vpc.as_ref().map(VpcConfigBody::from),
            nas_config: spec.nas.as_ref().map(NasConfigBody::from),
        }
    }
}

#[derive(Debug, Serialize)]
struct LogConfigBody<'a> {
    project: &'a str,
    logstore: &'a str,
}

impl<'a> From<&'a LogConfig> for LogConfigBody<'a> {
    fn from(log: &'a LogConfig) -> Self {
        Self {
            project: &log.project,
            logstore: &log.logstore,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VpcConfigBody<'a> {
    vpc_id: &'a str,
    #[serde(rename = "vSwitchIds")]
    vswitch_ids: &'a [String],
    security_group_id: &'a str,
}

impl<'a> From<&'a VpcConfig> for VpcConfigBody<'a> {
    fn from(vpc: &'a VpcConfig) -> Self {
        Self {
            vpc_id: &vpc.vpc_id,
            vswitch_ids: &vpc.vswitch_ids,
            security_group_id: &vpc.security_group_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NasConfigBody<'a> {
    user_id: i64,
    group_id: i64,
    mount_points: Vec<MountPointBody<'a>>,
}

impl<'a> From<&'a NasConfig> for NasConfigBody<'a> {
    fn from(nas: &'a NasConfig) -> Self {
        Self {
            user_id: nas.user_id,
            group_id: nas.group_id,
            mount_points: nas.mount_points.iter().map(MountPointBody::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MountPointBody<'a> {
    server_addr: &'a str,
    mount_dir: &'a str,
}

impl<'a> From<&'a NasMountPoint> for MountPointBody<'a> {
    fn from(mount: &'a NasMountPoint) -> Self {
        Self {
            server_addr: &mount.server_addr,
            mount_dir: &mount.mount_dir,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateFunctionBody<'a> {
    function_name: &'a str,
    handler: &'a str,
    runtime: &'a str,
    memory_size: u32,
    timeout: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    initializer: Option<&'a str>,
    initialization_timeout: u32,
    instance_type: &'a str,
    environment_variables: &'a BTreeMap<String, String>,
    code: CodeBody<'a>,
}

impl<'a> From<&'a FunctionSpec> for CreateFunctionBody<'a> {
    fn from(spec: &'a FunctionSpec) -> Self {
        Self {
            function_name: &spec.name,
            handler: &spec.handler,
            runtime: &spec.runtime,
            memory_size: spec.memory_mb,
            timeout: spec.timeout_secs,
            initializer: spec.initializer.as_deref(),
            initialization_timeout: spec.initialization_timeout_secs,
            instance_type: &spec.instance_type,
            environment_variables: &spec.environment,
            code: CodeBody::from(&spec.code),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CodeBody<'a> {
    Inline {
        #[serde(rename = "zipFile")]
        zip_file: &'a str,
    },
    ObjectStorage {
        #[serde(rename = "ossBucketName")]
        bucket: &'a str,
        #[serde(rename = "ossObjectName")]
        object: &'a str,
    },
}

impl<'a> From<&'a FunctionCode> for CodeBody<'a> {
    fn from(code: &'a FunctionCode) -> Self {
        match code {
            FunctionCode::Inline { zip_base64 } => Self::Inline {
                zip_file: zip_base64,
            },
            FunctionCode::ObjectStorage { bucket, object } => Self::ObjectStorage { bucket, object },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateTriggerBody<'a> {
    trigger_name: &'a str,
    trigger_type: &'a str,
    qualifier: &'a str,
    trigger_config: TriggerConfigBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerConfigBody<'a> {
    auth_type: &'a str,
    methods: &'a [String],
}

impl<'a> From<&'a TriggerSpec> for CreateTriggerBody<'a> {
    fn from(spec: &'a TriggerSpec) -> Self {
        Self {
            trigger_name: &spec.name,
            trigger_type: &spec.trigger_type,
            qualifier: &spec.qualifier,
            trigger_config: TriggerConfigBody {
                auth_type: &spec.auth_type,
                methods: &spec.methods,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdateEnvironmentBody<'a> {
    pub(crate) environment_variables: &'a BTreeMap<String, String>,
}

/// One page of a list call.
pub(crate) trait ListPage {
    /// Names on this page and the token for the next one.
    fn into_parts(self) -> (Vec<String>, Option<String>);
}

macro_rules! list_page {
    ($page:ident, $items:ident, $entry:ident, $field:ident) => {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub(crate) struct $page {
            #[serde(default)]
            $items: Vec<$entry>,
            #[serde(default)]
            next_token: Option<String>,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct $entry {
            $field: String,
        }

        impl ListPage for $page {
            fn into_parts(self) -> (Vec<String>, Option<String>) {
                let names = self.$items.into_iter().map(|entry| entry.$field).collect();
                (names, self.next_token.filter(|token| !token.is_empty()))
            }
        }
    };
}

list_page!(AliasPage, aliases, AliasEntry, alias_name);
list_page!(VersionPage, versions, VersionEntry, version_id);
list_page!(FunctionPage, functions, FunctionEntry, function_name);
list_page!(TriggerPage, triggers, TriggerEntry, trigger_name);

/// Error body returned by the API.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(rename = "ErrorCode", default)]
    pub(crate) code: String,
    #[serde(rename = "ErrorMessage", default)]
    pub(crate) message: String,
}
