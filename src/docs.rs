// docs.rs
use crate::{handlers, models};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::get_state, handlers::health),
    components(
        schemas(
            models::WsMessage,
            models::DeviceState,
            models::StateDelta,
            models::StateView,
            models::HealthReport,
            models::Task,
            models::HistoryEntry,
            models::Telemetry,
            models::Color,
            models::DeviceStatus
        )
    )
)]
pub struct ApiDoc;
