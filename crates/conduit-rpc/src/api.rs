// crates/conduit-rpc/src/api.rs
//
// The application's procedure catalogue: contract declarations for the user
// and time procedures, and the wiring of their handlers into a dispatcher.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::contract::{Contract, ContractRegistry};
use conduit_core::error::RegistryError;
use conduit_core::schema::{Field, Schema, SchemaValidator};
use conduit_core::traits::UserStore;
use conduit_core::user::NewUser;

use crate::dispatcher::Dispatcher;
use crate::handler::HandlerTable;
use crate::handlers::time::{self, TimeStreamRequest};
use crate::handlers::users::{self, SharedStore, UpdateUserRequest, UserIdRequest};

pub const USERS_LIST: &str = "users.list";
pub const USERS_GET: &str = "users.get";
pub const USERS_CREATE: &str = "users.create";
pub const USERS_UPDATE: &str = "users.update";
pub const USERS_DELETE: &str = "users.delete";
pub const TIME_STREAM: &str = "time.stream";

/// Shape of a stored user record.
pub fn user_schema() -> Schema {
    Schema::object(vec![
        Field::required("id", Schema::Integer),
        Field::required("email", Schema::email()),
        Field::required("name", Schema::string()),
        Field::required("createdAt", Schema::datetime()),
        Field::required("updatedAt", Schema::datetime()),
    ])
}

fn user_id_schema() -> Schema {
    Schema::object(vec![Field::required("id", Schema::Integer)])
}

/// Input of `users.create`.
pub fn create_user_schema() -> Schema {
    Schema::object(vec![
        Field::required("email", Schema::email()),
        Field::required("name", Schema::non_empty_string()),
    ])
}

fn update_user_schema() -> Schema {
    Schema::object(vec![
        Field::required("id", Schema::Integer),
        Field::required(
            "data",
            Schema::object(vec![
                Field::optional("email", Schema::email()),
                Field::optional("name", Schema::non_empty_string()),
            ]),
        ),
    ])
}

/// Shape of one `time.stream` event.
pub fn time_data_schema() -> Schema {
    Schema::object(vec![
        Field::required("timestamp", Schema::datetime()),
        Field::required("formatted", Schema::string()),
    ])
}

/// All contracts served by the daemon.
pub fn contracts() -> Result<ContractRegistry, RegistryError> {
    let mut registry = ContractRegistry::new();

    // `users.list` takes no input; whatever arrives is ignored.
    registry.register(Contract::unary(USERS_LIST, Schema::Any, Schema::array(user_schema())))?;
    registry.register(Contract::unary(USERS_GET, user_id_schema(), user_schema()))?;
    registry.register(Contract::unary(USERS_CREATE, create_user_schema(), user_schema()))?;
    registry.register(Contract::unary(USERS_UPDATE, update_user_schema(), user_schema()))?;
    registry.register(Contract::unary(
        USERS_DELETE,
        user_id_schema(),
        Schema::object(vec![Field::required("success", Schema::Bool)]),
    ))?;
    registry.register(Contract::streaming(
        TIME_STREAM,
        Schema::nullable(Schema::object(vec![Field::optional("limit", Schema::Integer)])),
        time_data_schema(),
    ))?;

    Ok(registry)
}

/// Handlers for every contract in [`contracts`].
pub fn handlers(store: Arc<dyn UserStore>, time_interval: Duration) -> Result<HandlerTable, RegistryError> {
    let mut table = HandlerTable::new();

    let s = store.clone();
    table.unary(USERS_LIST, move |_: serde_json::Value, _| {
        let store: SharedStore = s.clone();
        async move { users::handle_list_users(&store).await }
    })?;

    let s = store.clone();
    table.unary(USERS_GET, move |req: UserIdRequest, _| {
        let store = s.clone();
        async move { users::handle_get_user(&store, req).await }
    })?;

    let s = store.clone();
    table.unary(USERS_CREATE, move |req: NewUser, _| {
        let store = s.clone();
        async move { users::handle_create_user(&store, req).await }
    })?;

    let s = store.clone();
    table.unary(USERS_UPDATE, move |req: UpdateUserRequest, _| {
        let store = s.clone();
        async move { users::handle_update_user(&store, req).await }
    })?;

    let s = store;
    table.unary(USERS_DELETE, move |req: UserIdRequest, _| {
        let store = s.clone();
        async move { users::handle_delete_user(&store, req).await }
    })?;

    table.streaming(TIME_STREAM, move |req: Option<TimeStreamRequest>, ctx| {
        time::time_stream(time_interval, req.unwrap_or_default(), ctx.cancel)
    })?;

    Ok(table)
}

/// Build the dispatcher for the full catalogue over `store`.
pub fn build_dispatcher(
    store: Arc<dyn UserStore>,
    time_interval: Duration,
) -> Result<Dispatcher, RegistryError> {
    Dispatcher::new(
        contracts()?,
        handlers(store, time_interval)?,
        Arc::new(SchemaValidator),
    )
}
