// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provider for testing.
//!
//! Simulates compute, remote execution and logs in memory. Agents, command
//! statuses and failures are scripted by the test; every API call is counted.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

use super::*;

/// Scripted agent behaviour for one machine.
#[derive(Debug, Clone)]
struct MockAgent {
    registration: AgentRegistration,
    /// Number of filtered polls that must see the agent as absent first.
    hidden_for_polls: u32,
}

#[derive(Debug, Default)]
struct MockState {
    instances: HashMap<String, InstanceDescription>,
    agents: HashMap<String, MockAgent>,
    invocations: HashMap<(String, String), CommandInvocation>,
    sent: Vec<SendCommandRequest>,
    launches: Vec<LaunchRequest>,
    ingress: Vec<(String, PortRule)>,
    security_groups: Vec<String>,
    logs: HashMap<(String, String), Vec<LogEvent>>,
    agent_poll_failures: u32,
}

/// In-memory provider backend.
pub struct MockProvider {
    state: Mutex<MockState>,
    /// If true, launched machines immediately run with an online agent.
    pub auto_online: bool,
    /// If true, compute actions (launch/start/stop/terminate) fail.
    pub fail_compute: bool,
    /// If true, `describe_instances` fails.
    pub fail_describe_instances: bool,
    /// If true, `send_command` fails.
    pub fail_send_command: bool,
    /// If true, unfiltered agent listings (diagnostics) fail.
    pub fail_diagnostics: bool,
    /// If true, `authorize_ingress` fails.
    pub fail_ingress: bool,
    agent_polls: AtomicU32,
    describe_calls: AtomicU32,
    send_calls: AtomicU32,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    terminate_calls: AtomicU32,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Create a mock provider with no machines.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            auto_online: false,
            fail_compute: false,
            fail_describe_instances: false,
            fail_send_command: false,
            fail_diagnostics: false,
            fail_ingress: false,
            agent_polls: AtomicU32::new(0),
            describe_calls: AtomicU32::new(0),
            send_calls: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            terminate_calls: AtomicU32::new(0),
        }
    }

    /// Create a mock provider whose launched machines are immediately usable.
    pub fn auto_online() -> Self {
        Self {
            auto_online: true,
            ..Self::new()
        }
    }

    fn api_error(operation: &'static str) -> ProviderError {
        ProviderError::Api {
            operation,
            message: "mock failure".to_string(),
        }
    }

    fn online_agent(instance_id: &str) -> MockAgent {
        MockAgent {
            registration: AgentRegistration {
                instance_id: instance_id.to_string(),
                ping_status: PingStatus::Online,
                last_ping_at: Some(Utc::now()),
                agent_version: Some("3.3.0.0".to_string()),
            },
            hidden_for_polls: 0,
        }
    }

    /// Add a machine in the given provider state.
    pub async fn add_instance(&self, instance_id: &str, state: &str) {
        let mut guard = self.state.lock().await;
        guard.instances.insert(
            instance_id.to_string(),
            InstanceDescription {
                instance_id: instance_id.to_string(),
                state: state.to_string(),
                public_ip: None,
                private_ip: None,
            },
        );
    }

    /// Add a running machine with an online agent.
    pub async fn add_running_instance(&self, instance_id: &str) {
        self.add_instance(instance_id, "running").await;
        self.set_ips(instance_id, Some("203.0.113.10"), Some("10.0.1.10"))
            .await;
        self.register_agent(instance_id, PingStatus::Online).await;
    }

    /// Change the provider state of a machine.
    pub async fn set_instance_state(&self, instance_id: &str, state: &str) {
        let mut guard = self.state.lock().await;
        if let Some(instance) = guard.instances.get_mut(instance_id) {
            instance.state = state.to_string();
        }
    }

    /// Change the addresses of a machine.
    pub async fn set_ips(&self, instance_id: &str, public_ip: Option<&str>, private_ip: Option<&str>) {
        let mut guard = self.state.lock().await;
        if let Some(instance) = guard.instances.get_mut(instance_id) {
            instance.public_ip = public_ip.map(str::to_string);
            instance.private_ip = private_ip.map(str::to_string);
        }
    }

    /// Register an agent with the given heartbeat state.
    pub async fn register_agent(&self, instance_id: &str, ping_status: PingStatus) {
        let mut agent = Self::online_agent(instance_id);
        agent.registration.ping_status = ping_status;
        let mut guard = self.state.lock().await;
        guard.agents.insert(instance_id.to_string(), agent);
    }

    /// Make the agent invisible for the next `polls` filtered polls, then online.
    pub async fn agent_online_after(&self, instance_id: &str, polls: u32) {
        let mut agent = Self::online_agent(instance_id);
        agent.hidden_for_polls = polls;
        let mut guard = self.state.lock().await;
        guard.agents.insert(instance_id.to_string(), agent);
    }

    /// Fail the next `count` filtered agent polls with a transient error.
    pub async fn fail_next_agent_polls(&self, count: u32) {
        self.state.lock().await.agent_poll_failures = count;
    }

    /// Script the provider status and output of a sent command.
    pub async fn set_command_status(
        &self,
        command_id: &str,
        instance_id: &str,
        status: InvocationStatus,
        stdout: &str,
        stderr: &str,
    ) {
        let mut guard = self.state.lock().await;
        let key = (command_id.to_string(), instance_id.to_string());
        let now = Utc::now();
        let complete = status.is_complete();
        let invocation = guard
            .invocations
            .entry(key)
            .or_insert_with(|| CommandInvocation {
                command_id: command_id.to_string(),
                instance_id: instance_id.to_string(),
                status: InvocationStatus::Pending,
                stdout: String::new(),
                stderr: String::new(),
                started_at: None,
                ended_at: None,
            });
        invocation.status = status;
        invocation.stdout = stdout.to_string();
        invocation.stderr = stderr.to_string();
        invocation.started_at.get_or_insert(now);
        invocation.ended_at = complete.then_some(now);
    }

    /// Append a log event to a stream.
    pub async fn push_log_event(&self, log_group: &str, log_stream: &str, event: LogEvent) {
        let mut guard = self.state.lock().await;
        guard
            .logs
            .entry((log_group.to_string(), log_stream.to_string()))
            .or_default()
            .push(event);
    }

    /// Every command batch sent so far.
    pub async fn sent_commands(&self) -> Vec<SendCommandRequest> {
        self.state.lock().await.sent.clone()
    }

    /// Every launch request received so far.
    pub async fn launches(&self) -> Vec<LaunchRequest> {
        self.state.lock().await.launches.clone()
    }

    /// Every ingress rule opened so far, with its security group.
    pub async fn ingress_rules(&self) -> Vec<(String, PortRule)> {
        self.state.lock().await.ingress.clone()
    }

    /// Current provider state of a machine.
    pub async fn instance_state(&self, instance_id: &str) -> Option<String> {
        let guard = self.state.lock().await;
        guard.instances.get(instance_id).map(|i| i.state.clone())
    }

    /// Number of filtered agent polls.
    pub fn agent_poll_count(&self) -> u32 {
        self.agent_polls.load(Ordering::SeqCst)
    }

    /// Number of `describe_instances` calls.
    pub fn describe_count(&self) -> u32 {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Number of `send_command` calls.
    pub fn send_command_count(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// Number of `start_instance` calls.
    pub fn start_count(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Number of `stop_instance` calls.
    pub fn stop_count(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of `terminate_instance` calls.
    pub fn terminate_count(&self) -> u32 {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeApi for MockProvider {
    fn provider_type(&self) -> &'static str {
        "mock"
    }

    async fn launch_instance(&self, request: &LaunchRequest) -> Result<LaunchedInstance> {
        if self.fail_compute {
            return Err(Self::api_error("RunInstances"));
        }

        let simple = uuid::Uuid::new_v4().simple().to_string();
        let instance_id = format!("i-{}", &simple[..17]);
        let state = if self.auto_online {
            "running"
        } else {
            "pending"
        };

        let mut guard = self.state.lock().await;
        guard.launches.push(request.clone());
        guard.instances.insert(
            instance_id.clone(),
            InstanceDescription {
                instance_id: instance_id.clone(),
                state: state.to_string(),
                public_ip: self.auto_online.then(|| "203.0.113.20".to_string()),
                private_ip: self.auto_online.then(|| "10.0.1.20".to_string()),
            },
        );
        if self.auto_online {
            guard
                .agents
                .insert(instance_id.clone(), Self::online_agent(&instance_id));
        }

        Ok(LaunchedInstance {
            instance_id,
            state: state.to_string(),
            launched_at: Utc::now(),
        })
    }

    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceDescription>> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_describe_instances {
            return Err(Self::api_error("DescribeInstances"));
        }

        let guard = self.state.lock().await;
        Ok(instance_ids
            .iter()
            .filter_map(|id| guard.instances.get(id).cloned())
            .collect())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_compute {
            return Err(Self::api_error("StartInstances"));
        }
        let mut guard = self.state.lock().await;
        let instance = guard
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))?;
        instance.state = "pending".to_string();
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_compute {
            return Err(Self::api_error("StopInstances"));
        }
        let mut guard = self.state.lock().await;
        let instance = guard
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))?;
        instance.state = "stopping".to_string();
        instance.public_ip = None;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_compute {
            return Err(Self::api_error("TerminateInstances"));
        }
        let mut guard = self.state.lock().await;
        if let Some(instance) = guard.instances.get_mut(instance_id) {
            instance.state = "shutting-down".to_string();
            instance.public_ip = None;
        }
        guard.agents.remove(instance_id);
        Ok(())
    }

    async fn create_security_group(
        &self,
        name: &str,
        _description: &str,
        _vpc_id: Option<&str>,
    ) -> Result<String> {
        if self.fail_compute {
            return Err(Self::api_error("CreateSecurityGroup"));
        }
        let mut guard = self.state.lock().await;
        let group_id = format!("sg-{}-{}", name, guard.security_groups.len());
        guard.security_groups.push(group_id.clone());
        Ok(group_id)
    }

    async fn authorize_ingress(&self, security_group_id: &str, rule: &PortRule) -> Result<()> {
        if self.fail_ingress {
            return Err(Self::api_error("AuthorizeSecurityGroupIngress"));
        }
        let mut guard = self.state.lock().await;
        let entry = (security_group_id.to_string(), rule.clone());
        if !guard.ingress.contains(&entry) {
            guard.ingress.push(entry);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutionApi for MockProvider {
    async fn describe_agents(
        &self,
        instance_ids: Option<&[String]>,
    ) -> Result<Vec<AgentRegistration>> {
        let mut guard = self.state.lock().await;

        let Some(ids) = instance_ids else {
            if self.fail_diagnostics {
                return Err(Self::api_error("DescribeInstanceInformation"));
            }
            let mut all: Vec<AgentRegistration> = guard
                .agents
                .values()
                .map(|a| a.registration.clone())
                .collect();
            all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
            return Ok(all);
        };

        self.agent_polls.fetch_add(1, Ordering::SeqCst);
        if guard.agent_poll_failures > 0 {
            guard.agent_poll_failures -= 1;
            return Err(Self::api_error("DescribeInstanceInformation"));
        }

        let mut found = Vec::new();
        for id in ids {
            if let Some(agent) = guard.agents.get_mut(id) {
                if agent.hidden_for_polls > 0 {
                    agent.hidden_for_polls -= 1;
                    continue;
                }
                found.push(agent.registration.clone());
            }
        }
        Ok(found)
    }

    async fn send_command(&self, request: &SendCommandRequest) -> Result<String> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_send_command {
            return Err(Self::api_error("SendCommand"));
        }

        let command_id = uuid::Uuid::new_v4().to_string();
        let mut guard = self.state.lock().await;
        if !guard.instances.contains_key(&request.instance_id) {
            return Err(ProviderError::InstanceNotFound(request.instance_id.clone()));
        }
        guard.sent.push(request.clone());
        guard.invocations.insert(
            (command_id.clone(), request.instance_id.clone()),
            CommandInvocation {
                command_id: command_id.clone(),
                instance_id: request.instance_id.clone(),
                status: InvocationStatus::Pending,
                stdout: String::new(),
                stderr: String::new(),
                started_at: None,
                ended_at: None,
            },
        );
        Ok(command_id)
    }

    async fn get_command_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation> {
        let guard = self.state.lock().await;
        guard
            .invocations
            .get(&(command_id.to_string(), instance_id.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::InvocationNotFound {
                command_id: command_id.to_string(),
                instance_id: instance_id.to_string(),
            })
    }
}

#[async_trait]
impl LogApi for MockProvider {
    async fn fetch_log_events(&self, query: &LogQuery) -> Result<Vec<LogEvent>> {
        let guard = self.state.lock().await;
        let key = (query.log_group.clone(), query.log_stream.clone());
        let mut events: Vec<LogEvent> = guard
            .logs
            .get(&key)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.timestamp >= query.start && e.timestamp < query.end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|e| e.timestamp);
        if let Some(limit) = query.limit {
            events.truncate(limit.max(0) as usize);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_request() -> LaunchRequest {
        LaunchRequest {
            name: "test-db".to_string(),
            image_id: "ami-123".to_string(),
            instance_type: "t3.micro".to_string(),
            subnet_id: "subnet-1".to_string(),
            security_group_ids: vec!["sg-1".to_string()],
            instance_profile: None,
            key_name: None,
            user_data: String::new(),
            tags: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_launch_pending_without_agent() {
        let provider = MockProvider::new();
        let launched = provider.launch_instance(&launch_request()).await.unwrap();

        assert!(launched.instance_id.starts_with("i-"));
        assert_eq!(launched.state, "pending");

        let agents = provider
            .describe_agents(Some(std::slice::from_ref(&launched.instance_id)))
            .await
            .unwrap();
        assert!(agents.is_empty());
    }

    #[tokio::test]
    async fn test_mock_auto_online_launch() {
        let provider = MockProvider::auto_online();
        let launched = provider.launch_instance(&launch_request()).await.unwrap();

        let described = provider
            .describe_instances(&[launched.instance_id.clone()])
            .await
            .unwrap();
        assert_eq!(described[0].state, "running");
        assert!(described[0].public_ip.is_some());

        let agents = provider
            .describe_agents(Some(std::slice::from_ref(&launched.instance_id)))
            .await
            .unwrap();
        assert_eq!(agents[0].ping_status, PingStatus::Online);
    }

    #[tokio::test]
    async fn test_mock_agent_online_after_polls() {
        let provider = MockProvider::new();
        provider.add_instance("i-1", "running").await;
        provider.agent_online_after("i-1", 2).await;
        let ids = vec!["i-1".to_string()];

        assert!(provider.describe_agents(Some(ids.as_slice())).await.unwrap().is_empty());
        assert!(provider.describe_agents(Some(ids.as_slice())).await.unwrap().is_empty());
        assert_eq!(provider.describe_agents(Some(ids.as_slice())).await.unwrap().len(), 1);
        assert_eq!(provider.agent_poll_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_command_invocation_lifecycle() {
        let provider = MockProvider::new();
        provider.add_running_instance("i-1").await;

        let command_id = provider
            .send_command(&SendCommandRequest {
                instance_id: "i-1".to_string(),
                commands: vec!["echo hi".to_string()],
                execution_timeout: Duration::from_secs(60),
                comment: None,
            })
            .await
            .unwrap();

        let invocation = provider
            .get_command_invocation(&command_id, "i-1")
            .await
            .unwrap();
        assert_eq!(invocation.status, InvocationStatus::Pending);

        provider
            .set_command_status(&command_id, "i-1", InvocationStatus::Success, "hi\n", "")
            .await;
        let invocation = provider
            .get_command_invocation(&command_id, "i-1")
            .await
            .unwrap();
        assert_eq!(invocation.status, InvocationStatus::Success);
        assert_eq!(invocation.stdout, "hi\n");
        assert!(invocation.ended_at.is_some());

        let missing = provider.get_command_invocation(&command_id, "i-2").await;
        assert!(matches!(
            missing,
            Err(ProviderError::InvocationNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_terminate_moves_to_shutting_down() {
        let provider = MockProvider::new();
        provider.add_running_instance("i-1").await;

        provider.terminate_instance("i-1").await.unwrap();

        assert_eq!(
            provider.instance_state("i-1").await.as_deref(),
            Some("shutting-down")
        );
        assert_eq!(provider.terminate_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_logs_filtered_by_range() {
        let provider = MockProvider::new();
        let now = Utc::now();
        for minutes in [30, 20, 10] {
            provider
                .push_log_event(
                    "/dbfleet/instances",
                    "i-1",
                    LogEvent {
                        timestamp: now - chrono::Duration::minutes(minutes),
                        message: format!("{} minutes ago", minutes),
                    },
                )
                .await;
        }

        let events = provider
            .fetch_log_events(&LogQuery {
                log_group: "/dbfleet/instances".to_string(),
                log_stream: "i-1".to_string(),
                start: now - chrono::Duration::minutes(25),
                end: now,
                limit: None,
            })
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "20 minutes ago");
    }
}
