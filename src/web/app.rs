use axum::{
    Router,
    http::Method,
    routing::{delete, get, post, put},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    SharedContext, change_password, create_user, declare_table, delete_row, delete_settings, delete_user, get_form,
    get_settings, healthcheck, insert_row, join_tables, list_groups, list_rows, list_settings, list_tables,
    list_users, load_row, login, logout, refresh, register_group, save_settings, schema_diagram, settings_values,
    table_diagram, update_row, upload,
};

pub fn build_router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/password", post(change_password))
        .route("/api/users/:username", delete(delete_user))
        .route("/api/groups", get(list_groups).post(register_group))
        .route("/api/refresh", post(refresh))
        .route("/api/declare", post(declare_table))
        .route("/api/join", post(join_tables))
        .route("/api/diagram", get(schema_diagram))
        .route("/api/tables", get(list_tables))
        .route("/api/tables/:table/form", get(get_form))
        .route(
            "/api/tables/:table/rows",
            get(list_rows)
                .post(insert_row)
                .put(update_row)
                .delete(delete_row),
        )
        .route("/api/tables/:table/rows/load", post(load_row))
        .route("/api/tables/:table/diagram", get(table_diagram))
        .route("/api/tables/:table/settings", get(list_settings).post(save_settings))
        .route("/api/tables/:table/settings/:id", get(get_settings).delete(delete_settings))
        .route("/api/tables/:table/settings/:id/values", get(settings_values))
        .route("/api/uploads/:filename", put(upload))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
