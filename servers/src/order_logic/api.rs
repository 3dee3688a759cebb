//! # HTTP API
//!
//! The order routes that trigger notifications, the reads the dashboard and
//! the customer app use, and the health probes.
//!
//! Every failure is an `ApiError`, rendered as
//! `{"error_type": "...", "message": "..."}` with a matching status code.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lib_common::orders::{NewOrder, Order, OrderError, RestaurantStats, StoreError, Viewer};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::order_logic::auth::{AuthError, AuthRestaurant, AuthUser, Principal, PrincipalKind};
use crate::order_logic::state::AppState;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error("restaurant {restaurant_id} already has {limit} open dashboards")]
    TooManySessions { restaurant_id: String, limit: usize },
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Auth(e) => (
                e.status(),
                if e.status() == StatusCode::UNAUTHORIZED { "Unauthorized" } else { "Forbidden" },
            ),
            ApiError::Order(e) => match e {
                OrderError::InvalidStatus(_) => (StatusCode::BAD_REQUEST, "InvalidStatus"),
                e if e.is_validation() => (StatusCode::UNPROCESSABLE_ENTITY, "ValidationError"),
                OrderError::NotOwner(_) => (StatusCode::FORBIDDEN, "Forbidden"),
                OrderError::OrderNotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
                OrderError::Store(StoreError::Unavailable(_)) => (StatusCode::SERVICE_UNAVAILABLE, "StoreUnavailable"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "StoreError"),
            },
            ApiError::TooManySessions { .. } => (StatusCode::SERVICE_UNAVAILABLE, "TooManySessions"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.parts();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(%status, error = %self, "request failed");
            "The order store could not complete the request.".to_string()
        } else {
            tracing::debug!(%status, error = %self, "request rejected");
            self.to_string()
        };
        (status, Json(json!({"error_type": error_type, "message": message}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub restaurants: usize,
    pub sessions: usize,
}

/// `POST /pedidos`
pub async fn create_order(
    State(state): State<AppState>,
    AuthUser(usuario_id): AuthUser,
    Json(body): Json<NewOrder>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    let order = state.orders.place(usuario_id, &body).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// `PUT /pedidos/{pedido_id}/status?status=...`
pub async fn update_status(
    State(state): State<AppState>,
    AuthRestaurant(restaurante_id): AuthRestaurant,
    Path(pedido_id): Path<Uuid>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Order>> {
    let order = state
        .orders
        .update_status(restaurante_id, pedido_id, &query.status)
        .await?;
    Ok(Json(order))
}

/// `GET /pedidos/{pedido_id}`, for the customer who placed it or its restaurant.
pub async fn get_order(
    State(state): State<AppState>,
    principal: Principal,
    Path(pedido_id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    let viewer = match principal.kind {
        PrincipalKind::Restaurante => Viewer::Restaurant(principal.id),
        PrincipalKind::Usuario => Viewer::User(principal.id),
    };
    Ok(Json(state.orders.order_for(viewer, pedido_id).await?))
}

/// `GET /pedidos/restaurante/me`
pub async fn restaurant_orders(
    State(state): State<AppState>,
    AuthRestaurant(restaurante_id): AuthRestaurant,
) -> ApiResult<Json<Vec<Order>>> {
    Ok(Json(state.orders.orders_for_restaurant(restaurante_id).await?))
}

/// `GET /pedidos/usuario/me`
pub async fn user_orders(
    State(state): State<AppState>,
    AuthUser(usuario_id): AuthUser,
) -> ApiResult<Json<Vec<Order>>> {
    Ok(Json(state.orders.orders_for_user(usuario_id).await?))
}

/// `GET /restaurantes/estatisticas`
pub async fn restaurant_stats(
    State(state): State<AppState>,
    AuthRestaurant(restaurante_id): AuthRestaurant,
) -> ApiResult<Json<RestaurantStats>> {
    Ok(Json(state.orders.restaurant_stats(restaurante_id).await?))
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// `GET /health/sessions`
pub async fn session_health(State(state): State<AppState>) -> Json<SessionSummary> {
    Json(SessionSummary {
        restaurants: state.registry.restaurant_count(),
        sessions: state.registry.total_sessions(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn order_errors_map_to_status_codes() {
        let id = Uuid::new_v4();
        assert_eq!(status_of(OrderError::InvalidStatus("Pronto".into()).into()), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(OrderError::EmptyOrder.into()), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_of(OrderError::UnknownMenuItem(id).into()), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_of(OrderError::NotOwner(id).into()), StatusCode::FORBIDDEN);
        assert_eq!(status_of(OrderError::OrderNotFound(id).into()), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(OrderError::Store(StoreError::Unavailable("pool exhausted".into())).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(OrderError::Store(StoreError::Corrupt("bad row".into())).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn auth_errors_map_to_status_codes() {
        assert_eq!(status_of(AuthError::MissingToken.into()), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(AuthError::Forbidden.into()), StatusCode::FORBIDDEN);
    }

    #[test]
    fn full_restaurant_is_service_unavailable() {
        let err = ApiError::TooManySessions {
            restaurant_id: "r1".into(),
            limit: 2,
        };
        assert_eq!(status_of(err), StatusCode::SERVICE_UNAVAILABLE);
    }
}
