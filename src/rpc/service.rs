//! `SandboxService` gRPC implementation (§4.8, §6).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::wait::await_condition;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use super::proto::sandbox_service_server::SandboxService;
use super::proto::{
    CreateAgentSessionRequest, CreateCodeInterpreterRequest, CreateSessionResponse,
    DeleteAgentSessionRequest, DeleteAgentSessionResponse, GetAgentSessionRequest,
};
use crate::config::Config;
use crate::controllers::session::SessionResource;
use crate::crd::{
    AgentSession, AgentSessionSpec, CodeInterpreter, CodeInterpreterSpec, RuntimeRef,
    SessionSpecCore,
};
use crate::error::GatewayError;
use crate::registry::{SessionInfo, SessionRegistry};

const READINESS_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Gateway {
    client: Client,
    registry: SessionRegistry,
    cfg: Arc<Config>,
}

impl Gateway {
    pub fn new(client: Client, registry: SessionRegistry, cfg: Arc<Config>) -> Self {
        Self { client, registry, cfg }
    }
}

#[tonic::async_trait]
impl SandboxService for Gateway {
    #[tracing::instrument(skip(self, request), err)]
    async fn create_code_interpreter(
        &self,
        request: Request<CreateCodeInterpreterRequest>,
    ) -> Result<Response<CreateSessionResponse>, Status> {
        let language = request.into_inner().language;
        if language.is_empty() {
            return Err(GatewayError::BadRequest("language is required".into()).into());
        }
        let name = generate_session_name();
        let spec = CodeInterpreterSpec {
            core: SessionSpecCore {
                template: Some(crate::crd::SandboxTemplate {
                    image: interpreter_image(&language),
                    command: vec![],
                    args: vec![],
                }),
                max_session_duration_secs: Some(self.cfg.max_session_duration.as_secs() as i64),
                ..Default::default()
            },
            language,
        };
        let session = CodeInterpreter::new(&name, spec);
        let response = self.create_session::<CodeInterpreter>(session).await?;
        Ok(Response::new(response))
    }

    #[tracing::instrument(skip(self, request), err)]
    async fn create_agent_session(
        &self,
        request: Request<CreateAgentSessionRequest>,
    ) -> Result<Response<CreateSessionResponse>, Status> {
        let req = request.into_inner();
        if req.runtime_name.is_empty() {
            return Err(GatewayError::BadRequest("runtimeName is required".into()).into());
        }
        let name = generate_session_name();
        let spec = AgentSessionSpec {
            core: SessionSpecCore {
                runtime_ref: Some(RuntimeRef {
                    name: req.runtime_name,
                    namespace: req.runtime_namespace,
                }),
                max_session_duration_secs: Some(self.cfg.max_session_duration.as_secs() as i64),
                ..Default::default()
            },
        };
        let session = AgentSession::new(&name, spec);
        let response = self.create_session::<AgentSession>(session).await?;
        Ok(Response::new(response))
    }

    #[tracing::instrument(skip(self, request), err)]
    async fn get_agent_session(
        &self,
        request: Request<GetAgentSessionRequest>,
    ) -> Result<Response<CreateSessionResponse>, Status> {
        let session_id = request.into_inner().session_id;
        let info = self.registry.get_session(&session_id).await.map_err(GatewayError::from)?;
        Ok(Response::new(CreateSessionResponse {
            sandbox_id: info.sandbox_id,
            endpoint: info.grpc_endpoint,
        }))
    }

    #[tracing::instrument(skip(self, request), err)]
    async fn delete_agent_session(
        &self,
        request: Request<DeleteAgentSessionRequest>,
    ) -> Result<Response<DeleteAgentSessionResponse>, Status> {
        let session_id = request.into_inner().session_id;
        let ns = &self.cfg.sandbox_namespace;

        delete_ignoring_not_found::<AgentSession>(&self.client, ns, &session_id).await?;
        delete_ignoring_not_found::<CodeInterpreter>(&self.client, ns, &session_id).await?;

        self.registry
            .delete_session(&session_id)
            .await
            .map_err(GatewayError::from)?;

        Ok(Response::new(DeleteAgentSessionResponse {}))
    }
}

impl Gateway {
    async fn create_session<K: SessionResource>(
        &self,
        session: K,
    ) -> Result<CreateSessionResponse, Status> {
        let sessions: Api<K> = Api::namespaced(self.client.clone(), &self.cfg.sandbox_namespace);
        let name = kube::ResourceExt::name_any(&session);
        sessions
            .create(&PostParams::default(), &session)
            .await
            .map_err(GatewayError::from)?;

        let waited = tokio::time::timeout(
            READINESS_TIMEOUT,
            await_condition(sessions.clone(), &name, session_settled::<K>),
        )
        .await
        .map_err(|_| GatewayError::ReadinessTimeout)?
        .map_err(|e| GatewayError::Internal(e.into()))?;

        let settled = waited.ok_or(GatewayError::ReadinessTimeout)?;
        let status = settled.status().cloned().unwrap_or_default();

        if let Some((reason, message)) = status.accepted_failure() {
            return Err(GatewayError::SessionFailed {
                reason: reason.to_owned(),
                message: message.to_owned(),
            }
            .into());
        }

        if !status.is_running() {
            return Err(GatewayError::ReadinessTimeout.into());
        }

        let endpoint = format!("{}:{}", status.pod_ip, self.cfg.interpreter_port);
        let now = Utc::now();
        let info = SessionInfo {
            sandbox_id: name.clone(),
            grpc_endpoint: endpoint.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(self.cfg.max_session_duration).unwrap(),
        };
        self.registry.create_session(&info).await.map_err(GatewayError::from)?;

        Ok(CreateSessionResponse {
            sandbox_id: name,
            endpoint,
        })
    }
}

fn session_settled<K: SessionResource>(obj: Option<&K>) -> bool {
    match obj.and_then(SessionResource::status) {
        Some(status) => status.is_running() || status.accepted_failure().is_some(),
        None => false,
    }
}

async fn delete_ignoring_not_found<K>(client: &Client, namespace: &str, name: &str) -> Result<(), Status>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(err) => Err(GatewayError::from(err).into()),
    }
}

fn generate_session_name() -> String {
    format!("sess-{}", Uuid::now_v7().simple())
}

/// Maps a requested interpreter language to its sandbox image.
fn interpreter_image(language: &str) -> String {
    format!("korokd-{language}:latest")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_session_names_are_unique() {
        let a = generate_session_name();
        let b = generate_session_name();
        assert_ne!(a, b);
        assert!(a.starts_with("sess-"));
    }

    #[test]
    fn interpreter_image_embeds_language() {
        assert_eq!(interpreter_image("python"), "korokd-python:latest");
    }
}
