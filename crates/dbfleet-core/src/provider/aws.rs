// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS backend: EC2 for compute, SSM for remote execution, CloudWatch Logs for logs.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{
    Filter, IamInstanceProfileSpecification, InstanceType, IpPermission, IpRange, ResourceType,
    Tag, TagSpecification,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{
    AgentRegistration, CommandInvocation, ComputeApi, InstanceDescription, InvocationStatus,
    LaunchRequest, LaunchedInstance, LogApi, LogEvent, LogQuery, PingStatus, ProviderError,
    RemoteExecutionApi, Result, SendCommandRequest,
};
use crate::config::ProviderConfig;
use crate::model::PortRule;

const RUN_SHELL_DOCUMENT: &str = "AWS-RunShellScript";
const DUPLICATE_RULE_CODE: &str = "InvalidPermission.Duplicate";

fn api_error<E>(operation: &'static str, err: E) -> ProviderError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ProviderError::Api {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

fn smithy_time(value: &aws_sdk_ec2::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

fn rfc3339(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .filter(|v| !v.is_empty())
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// AWS provider clients.
#[derive(Clone)]
pub struct AwsProvider {
    ec2: aws_sdk_ec2::Client,
    ssm: aws_sdk_ssm::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
}

impl AwsProvider {
    /// Build clients for the configured region.
    ///
    /// Static credentials are used when configured, otherwise the default
    /// credential chain (environment, profile, instance role).
    pub async fn new(config: &ProviderConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let Some(creds) = &config.credentials {
            loader = loader.credentials_provider(aws_sdk_ec2::config::Credentials::new(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
                None,
                None,
                "dbfleet-static",
            ));
        }
        let shared = loader.load().await;

        info!(region = %config.region, "AWS provider initialized");

        Self {
            ec2: aws_sdk_ec2::Client::new(&shared),
            ssm: aws_sdk_ssm::Client::new(&shared),
            logs: aws_sdk_cloudwatchlogs::Client::new(&shared),
        }
    }
}

#[async_trait]
impl ComputeApi for AwsProvider {
    fn provider_type(&self) -> &'static str {
        "aws"
    }

    async fn launch_instance(&self, request: &LaunchRequest) -> Result<LaunchedInstance> {
        let mut tags = vec![Tag::builder().key("Name").value(&request.name).build()];
        for (key, value) in &request.tags {
            tags.push(Tag::builder().key(key).value(value).build());
        }
        let tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .set_tags(Some(tags))
            .build();

        let output = self
            .ec2
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .subnet_id(&request.subnet_id)
            .set_security_group_ids(Some(request.security_group_ids.clone()))
            .set_iam_instance_profile(request.instance_profile.as_ref().map(|name| {
                IamInstanceProfileSpecification::builder().name(name).build()
            }))
            .set_key_name(request.key_name.clone())
            .user_data(&request.user_data)
            .tag_specifications(tag_spec)
            .send()
            .await
            .map_err(|e| api_error("RunInstances", e))?;

        let instance = output
            .instances()
            .first()
            .ok_or_else(|| ProviderError::InvalidResponse("RunInstances returned no instance".into()))?;
        let instance_id = instance
            .instance_id()
            .ok_or_else(|| ProviderError::InvalidResponse("instance without id".into()))?
            .to_string();

        debug!(instance_id = %instance_id, "EC2 accepted launch");

        Ok(LaunchedInstance {
            instance_id,
            state: instance
                .state()
                .and_then(|s| s.name())
                .map(|n| n.as_str().to_string())
                .unwrap_or_else(|| "pending".to_string()),
            launched_at: instance
                .launch_time()
                .and_then(smithy_time)
                .unwrap_or_else(Utc::now),
        })
    }

    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceDescription>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }

        // A filter, unlike InstanceIds, does not fail the whole call on unknown ids.
        let filter = Filter::builder()
            .name("instance-id")
            .set_values(Some(instance_ids.to_vec()))
            .build();

        let mut descriptions = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .ec2
                .describe_instances()
                .filters(filter.clone())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| api_error("DescribeInstances", e))?;

            for reservation in output.reservations() {
                for instance in reservation.instances() {
                    let Some(instance_id) = instance.instance_id() else {
                        continue;
                    };
                    descriptions.push(InstanceDescription {
                        instance_id: instance_id.to_string(),
                        state: instance
                            .state()
                            .and_then(|s| s.name())
                            .map(|n| n.as_str().to_string())
                            .unwrap_or_default(),
                        public_ip: instance.public_ip_address().map(str::to_string),
                        private_ip: instance.private_ip_address().map(str::to_string),
                    });
                }
            }

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(descriptions)
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.ec2
            .start_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| api_error("StartInstances", e))?;
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.ec2
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| api_error("StopInstances", e))?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| api_error("TerminateInstances", e))?;
        Ok(())
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> Result<String> {
        let output = self
            .ec2
            .create_security_group()
            .group_name(name)
            .description(description)
            .set_vpc_id(vpc_id.map(str::to_string))
            .send()
            .await
            .map_err(|e| api_error("CreateSecurityGroup", e))?;

        output
            .group_id()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::InvalidResponse("security group without id".into()))
    }

    async fn authorize_ingress(&self, security_group_id: &str, rule: &PortRule) -> Result<()> {
        let permission = IpPermission::builder()
            .ip_protocol(&rule.protocol)
            .from_port(i32::from(rule.from_port))
            .to_port(i32::from(rule.to_port))
            .ip_ranges(IpRange::builder().cidr_ip(&rule.cidr).build())
            .build();

        let result = self
            .ec2
            .authorize_security_group_ingress()
            .group_id(security_group_id)
            .ip_permissions(permission)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().and_then(|s| s.code()) == Some(DUPLICATE_RULE_CODE) => {
                debug!(security_group_id = %security_group_id, port = rule.from_port, "Ingress rule already present");
                Ok(())
            }
            Err(e) => Err(api_error("AuthorizeSecurityGroupIngress", e)),
        }
    }
}

#[async_trait]
impl RemoteExecutionApi for AwsProvider {
    async fn describe_agents(
        &self,
        instance_ids: Option<&[String]>,
    ) -> Result<Vec<AgentRegistration>> {
        let filter = match instance_ids {
            Some(ids) => Some(
                aws_sdk_ssm::types::InstanceInformationStringFilter::builder()
                    .key("InstanceIds")
                    .set_values(Some(ids.to_vec()))
                    .build()
                    .map_err(|e| api_error("DescribeInstanceInformation", e))?,
            ),
            None => None,
        };

        let mut agents = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .ssm
                .describe_instance_information()
                .set_filters(filter.clone().map(|f| vec![f]))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| api_error("DescribeInstanceInformation", e))?;

            for info in output.instance_information_list() {
                let Some(instance_id) = info.instance_id() else {
                    continue;
                };
                agents.push(AgentRegistration {
                    instance_id: instance_id.to_string(),
                    ping_status: info
                        .ping_status()
                        .map(|s| PingStatus::parse(s.as_str()))
                        .unwrap_or_else(|| PingStatus::Unknown(String::new())),
                    last_ping_at: info.last_ping_date_time().and_then(smithy_time),
                    agent_version: info.agent_version().map(str::to_string),
                });
            }

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(agents)
    }

    async fn send_command(&self, request: &SendCommandRequest) -> Result<String> {
        let output = self
            .ssm
            .send_command()
            .document_name(RUN_SHELL_DOCUMENT)
            .instance_ids(&request.instance_id)
            .parameters("commands", request.commands.clone())
            .parameters(
                "executionTimeout",
                vec![request.execution_timeout.as_secs().to_string()],
            )
            .set_comment(request.comment.clone())
            .send()
            .await
            .map_err(|e| api_error("SendCommand", e))?;

        output
            .command()
            .and_then(|c| c.command_id())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::InvalidResponse("SendCommand returned no command id".into()))
    }

    async fn get_command_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation> {
        let output = self
            .ssm
            .get_command_invocation()
            .command_id(command_id)
            .instance_id(instance_id)
            .send()
            .await
            .map_err(|e| {
                if e
                    .as_service_error()
                    .is_some_and(|s| s.is_invocation_does_not_exist())
                {
                    ProviderError::InvocationNotFound {
                        command_id: command_id.to_string(),
                        instance_id: instance_id.to_string(),
                    }
                } else {
                    api_error("GetCommandInvocation", e)
                }
            })?;

        Ok(CommandInvocation {
            command_id: command_id.to_string(),
            instance_id: instance_id.to_string(),
            status: output
                .status()
                .map(|s| InvocationStatus::parse(s.as_str()))
                .unwrap_or(InvocationStatus::Pending),
            stdout: output.standard_output_content().unwrap_or_default().to_string(),
            stderr: output.standard_error_content().unwrap_or_default().to_string(),
            started_at: rfc3339(output.execution_start_date_time()),
            ended_at: rfc3339(output.execution_end_date_time()),
        })
    }
}

#[async_trait]
impl LogApi for AwsProvider {
    async fn fetch_log_events(&self, query: &LogQuery) -> Result<Vec<LogEvent>> {
        let result = self
            .logs
            .get_log_events()
            .log_group_name(&query.log_group)
            .log_stream_name(&query.log_stream)
            .start_time(query.start.timestamp_millis())
            .end_time(query.end.timestamp_millis())
            .set_limit(query.limit)
            .start_from_head(true)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|s| s.is_resource_not_found_exception()) =>
            {
                debug!(
                    log_group = %query.log_group,
                    log_stream = %query.log_stream,
                    "Log stream does not exist yet"
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(api_error("GetLogEvents", e)),
        };

        Ok(output
            .events()
            .iter()
            .filter_map(|event| {
                Some(LogEvent {
                    timestamp: DateTime::from_timestamp_millis(event.timestamp()?)?,
                    message: event.message().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_parsing() {
        assert!(rfc3339(None).is_none());
        assert!(rfc3339(Some("")).is_none());
        let parsed = rfc3339(Some("2025-06-01T10:00:00.000Z")).unwrap();
        assert_eq!(parsed.timestamp(), 1748772000);
    }
}
