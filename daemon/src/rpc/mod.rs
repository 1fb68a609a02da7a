// HTTP command surface: a thin projection over the engines. Commands carry an
// idempotency key; replays return the stored response. RBAC sits in front of
// this server and is out of scope here.

use std::{fmt, sync::Arc};

use actix_web::{
    http::StatusCode,
    web::{self, Data, Json},
    HttpResponse, HttpServer, ResponseError,
};
use log::{debug, info};
use serde_json::json;

use meridian_common::{
    api::{
        ApiError, ApiErrorCode, CancelTicketRequest, CommandEnvelope, CommandStatus,
        ExecutePlanRequest, ForecastResponse, PlanResponse, ResyncRequest, ResyncResponse,
        TicketActionRequest, TicketActionResponse, TriggerForecastRequest,
    },
    approval::{ApprovalAction, TicketStateError},
    rebalance::RebalanceTrigger,
};

use crate::{
    approval::ApprovalError,
    chain::{ChainGateway, GatewayError},
    core::storage::Storage,
    node::Node,
    rebalance::RebalanceError,
    risk::RiskError,
};

// actix needs Display + Debug for ResponseError
#[derive(Debug)]
pub struct CommandError(ApiError);

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0.code, self.0.message)
    }
}

impl ResponseError for CommandError {
    fn status_code(&self) -> StatusCode {
        match self.0.code {
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::ValidationError
            | ApiErrorCode::NoRuleMatched
            | ApiErrorCode::UnsupportedReference => StatusCode::BAD_REQUEST,
            ApiErrorCode::AlreadyActed | ApiErrorCode::TerminalState => StatusCode::CONFLICT,
            ApiErrorCode::SimulationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ApiErrorCode::ChainUnavailable => StatusCode::BAD_GATEWAY,
            ApiErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(&self.0)
    }
}

// Stable user-visible codes, decoupled from internal error text
impl From<ApprovalError> for CommandError {
    fn from(e: ApprovalError) -> Self {
        let error = match &e {
            ApprovalError::NoRuleMatched(_) => {
                ApiError::new(ApiErrorCode::NoRuleMatched, "no approval rule matched")
            }
            ApprovalError::UnsupportedReference(_) => ApiError::new(
                ApiErrorCode::UnsupportedReference,
                "reference type is not supported",
            ),
            ApprovalError::TicketNotFound(id) => {
                ApiError::new(ApiErrorCode::NotFound, format!("ticket {} not found", id))
            }
            ApprovalError::RedemptionNotFound(id) => ApiError::new(
                ApiErrorCode::NotFound,
                format!("redemption {} not found", id),
            ),
            ApprovalError::TicketState(TicketStateError::AlreadyActed { .. }) => {
                ApiError::new(ApiErrorCode::AlreadyActed, "approver already acted")
            }
            ApprovalError::TicketState(TicketStateError::Terminal(_))
            | ApprovalError::TicketState(TicketStateError::NotCancellable(_)) => {
                ApiError::new(ApiErrorCode::TerminalState, "ticket is already resolved")
            }
            ApprovalError::TicketState(_) => {
                ApiError::new(ApiErrorCode::ValidationError, "action not allowed")
            }
            ApprovalError::Gateway(g) => gateway_error(g),
            _ => ApiError::new(ApiErrorCode::Internal, "internal error"),
        };
        CommandError(error)
    }
}

impl From<RebalanceError> for CommandError {
    fn from(e: RebalanceError) -> Self {
        let error = match &e {
            RebalanceError::PlanNotFound(id) => {
                ApiError::new(ApiErrorCode::NotFound, format!("plan {} not found", id))
            }
            RebalanceError::InvalidPlanState { id, status, .. } => ApiError::new(
                ApiErrorCode::ValidationError,
                format!("plan {} is {}", id, status),
            ),
            RebalanceError::SimulationReverted { reason, .. } => ApiError::new(
                ApiErrorCode::SimulationFailed,
                format!("simulation reverted: {}", reason),
            ),
            RebalanceError::SlippageExceeded {
                predicted_bps,
                max_bps,
                ..
            } => ApiError::new(
                ApiErrorCode::SimulationFailed,
                format!(
                    "predicted slippage {}bp exceeds the {}bp limit",
                    predicted_bps, max_bps
                ),
            ),
            RebalanceError::ProjectionDrift { .. } => ApiError::new(
                ApiErrorCode::SimulationFailed,
                "projected state drifts from target",
            ),
            RebalanceError::Gateway(g) => gateway_error(g),
            RebalanceError::Approval(ApprovalError::NoRuleMatched(_)) => {
                ApiError::new(ApiErrorCode::NoRuleMatched, "no approval rule matched")
            }
            _ => ApiError::new(ApiErrorCode::Internal, "internal error"),
        };
        CommandError(error)
    }
}

impl From<RiskError> for CommandError {
    fn from(e: RiskError) -> Self {
        let error = match &e {
            RiskError::Gateway(g) => gateway_error(g),
            _ => ApiError::new(ApiErrorCode::Internal, "internal error"),
        };
        CommandError(error)
    }
}

impl From<crate::ingest::IngestError> for CommandError {
    fn from(e: crate::ingest::IngestError) -> Self {
        let error = match &e {
            crate::ingest::IngestError::Gateway(g) => gateway_error(g),
            _ => ApiError::new(ApiErrorCode::Internal, "internal error"),
        };
        CommandError(error)
    }
}

impl From<crate::core::error::StorageError> for CommandError {
    fn from(_: crate::core::error::StorageError) -> Self {
        CommandError(ApiError::new(ApiErrorCode::Internal, "storage error"))
    }
}

fn gateway_error(e: &GatewayError) -> ApiError {
    let mut error = ApiError::new(ApiErrorCode::ChainUnavailable, "chain gateway unavailable");
    if let GatewayError::ReceiptFailed(_) = e {
        // on-chain commit failures surface the terminal receipt status
        error.receipt_status = Some(false);
        error.message = "on-chain commit reverted".to_string();
    }
    error
}

pub struct ApiState<S: Storage, G: ChainGateway> {
    pub node: Arc<Node<S, G>>,
}

// Replay guard shared by every command handler
async fn replay_or_store<S, G, F, R>(
    state: &ApiState<S, G>,
    key: &str,
    run: F,
) -> Result<Json<R>, CommandError>
where
    S: Storage,
    G: ChainGateway,
    R: serde::Serialize + serde::de::DeserializeOwned,
    F: std::future::Future<Output = Result<R, CommandError>>,
{
    if let Some(cached) = state.node.storage.get_command_response(key).await? {
        debug!("idempotent replay for key {}", key);
        let response: R = serde_json::from_value(cached)
            .map_err(|_| CommandError(ApiError::new(ApiErrorCode::Internal, "cache error")))?;
        return Ok(Json(response));
    }

    let response = run.await?;
    let value = serde_json::to_value(&response)
        .map_err(|_| CommandError(ApiError::new(ApiErrorCode::Internal, "encode error")))?;
    state.node.storage.put_command_response(key, &value).await?;
    Ok(Json(response))
}

async fn ticket_action<S: Storage, G: ChainGateway>(
    state: &ApiState<S, G>,
    envelope: CommandEnvelope<TicketActionRequest>,
    action: ApprovalAction,
) -> Result<Json<TicketActionResponse>, CommandError> {
    let key = envelope.idempotency_key.clone();
    replay_or_store(state, &key, async {
        let ticket = state
            .node
            .approval
            .act(
                envelope.command.ticket_id,
                &envelope.requester,
                envelope.command.role,
                action,
                envelope.command.reason.clone(),
                None,
            )
            .await?;
        Ok(TicketActionResponse {
            status: CommandStatus::Completed,
            ticket_id: ticket.id,
            ticket_status: ticket.status,
        })
    })
    .await
}

async fn approve_ticket<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
    body: Json<CommandEnvelope<TicketActionRequest>>,
) -> Result<Json<TicketActionResponse>, CommandError> {
    ticket_action(&state, body.into_inner(), ApprovalAction::Approve).await
}

async fn reject_ticket<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
    body: Json<CommandEnvelope<TicketActionRequest>>,
) -> Result<Json<TicketActionResponse>, CommandError> {
    ticket_action(&state, body.into_inner(), ApprovalAction::Reject).await
}

async fn cancel_ticket<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
    body: Json<CommandEnvelope<CancelTicketRequest>>,
) -> Result<Json<TicketActionResponse>, CommandError> {
    let envelope = body.into_inner();
    let key = envelope.idempotency_key.clone();
    replay_or_store(&state, &key, async {
        let ticket = state
            .node
            .approval
            .cancel(envelope.command.ticket_id, &envelope.requester)
            .await?;
        Ok(TicketActionResponse {
            status: CommandStatus::Completed,
            ticket_id: ticket.id,
            ticket_status: ticket.status,
        })
    })
    .await
}

async fn preview_plan<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
) -> Result<Json<PlanResponse>, CommandError> {
    let plan = state.node.rebalance.preview(RebalanceTrigger::Manual).await?;
    Ok(Json(PlanResponse {
        status: CommandStatus::Completed,
        plan_id: None,
        plan_status: plan.as_ref().map(|p| p.status),
        plan,
    }))
}

async fn execute_plan<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
    body: Json<CommandEnvelope<ExecutePlanRequest>>,
) -> Result<Json<PlanResponse>, CommandError> {
    let envelope = body.into_inner();
    let key = envelope.idempotency_key.clone();
    replay_or_store(&state, &key, async {
        let plan = state
            .node
            .rebalance
            .execute(envelope.command.plan_id)
            .await?;
        Ok(PlanResponse {
            status: CommandStatus::Completed,
            plan_id: Some(plan.id),
            plan_status: Some(plan.status),
            plan: Some(plan),
        })
    })
    .await
}

async fn trigger_rebalance<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
    body: Json<CommandEnvelope<serde_json::Value>>,
) -> Result<Json<PlanResponse>, CommandError> {
    let envelope = body.into_inner();
    let key = envelope.idempotency_key.clone();
    replay_or_store(&state, &key, async {
        let plan = state.node.rebalance.evaluate(RebalanceTrigger::Manual).await?;
        Ok(PlanResponse {
            status: if plan.is_some() {
                CommandStatus::Accepted
            } else {
                CommandStatus::Completed
            },
            plan_id: plan.as_ref().map(|p| p.id),
            plan_status: plan.as_ref().map(|p| p.status),
            plan,
        })
    })
    .await
}

async fn trigger_forecast<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
    body: Json<CommandEnvelope<TriggerForecastRequest>>,
) -> Result<Json<ForecastResponse>, CommandError> {
    let envelope = body.into_inner();
    let forecast = state.node.risk.forecast(envelope.command.horizon).await?;
    Ok(Json(ForecastResponse {
        status: CommandStatus::Completed,
        forecast,
    }))
}

async fn resync<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
    body: Json<CommandEnvelope<ResyncRequest>>,
) -> Result<Json<ResyncResponse>, CommandError> {
    let envelope = body.into_inner();
    state.node.resync(envelope.command.from_block).await?;
    Ok(Json(ResyncResponse {
        status: CommandStatus::Accepted,
        from_block: envelope.command.from_block,
    }))
}

// Read-side projections
async fn get_fund<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
) -> Result<HttpResponse, CommandError> {
    let projection = state.node.storage.get_fund_projection().await?;
    Ok(HttpResponse::Ok().json(projection))
}

async fn get_ticket<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
    path: web::Path<u64>,
) -> Result<HttpResponse, CommandError> {
    let id = path.into_inner();
    match state.node.storage.get_ticket(id).await? {
        Some(ticket) => Ok(HttpResponse::Ok().json(ticket)),
        None => Err(CommandError(ApiError::new(
            ApiErrorCode::NotFound,
            format!("ticket {} not found", id),
        ))),
    }
}

async fn get_plan<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
    path: web::Path<u64>,
) -> Result<HttpResponse, CommandError> {
    let id = path.into_inner();
    match state.node.storage.get_plan(id).await? {
        Some(plan) => Ok(HttpResponse::Ok().json(plan)),
        None => Err(CommandError(ApiError::new(
            ApiErrorCode::NotFound,
            format!("plan {} not found", id),
        ))),
    }
}

async fn get_risk<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
) -> Result<HttpResponse, CommandError> {
    let snapshots = state.node.storage.latest_risk_snapshots(1).await?;
    Ok(HttpResponse::Ok().json(json!({ "latest": snapshots.first() })))
}

async fn get_deviations<S: Storage, G: ChainGateway>(
    state: Data<ApiState<S, G>>,
) -> Result<HttpResponse, CommandError> {
    let deviations = state.node.rebalance.deviations().await?;
    Ok(HttpResponse::Ok().json(deviations))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub fn configure<S: Storage, G: ChainGateway>(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/fund", web::get().to(get_fund::<S, G>))
        .route("/tickets/{id}", web::get().to(get_ticket::<S, G>))
        .route("/plans/{id}", web::get().to(get_plan::<S, G>))
        .route("/risk/latest", web::get().to(get_risk::<S, G>))
        .route("/rebalance/deviations", web::get().to(get_deviations::<S, G>))
        .route(
            "/commands/tickets/approve",
            web::post().to(approve_ticket::<S, G>),
        )
        .route(
            "/commands/tickets/reject",
            web::post().to(reject_ticket::<S, G>),
        )
        .route(
            "/commands/tickets/cancel",
            web::post().to(cancel_ticket::<S, G>),
        )
        .route("/commands/plans/preview", web::post().to(preview_plan::<S, G>))
        .route("/commands/plans/execute", web::post().to(execute_plan::<S, G>))
        .route(
            "/commands/rebalance/trigger",
            web::post().to(trigger_rebalance::<S, G>),
        )
        .route("/commands/forecast", web::post().to(trigger_forecast::<S, G>))
        .route("/commands/resync", web::post().to(resync::<S, G>));
}

pub async fn run_server<S: Storage, G: ChainGateway>(
    node: Arc<Node<S, G>>,
    bind_address: &str,
) -> std::io::Result<()> {
    info!("command API listening on {}", bind_address);
    let state = Data::new(ApiState { node });
    HttpServer::new(move || {
        actix_web::App::new()
            .app_data(state.clone())
            .configure(configure::<S, G>)
    })
    .bind(bind_address)?
    .run()
    .await
}
