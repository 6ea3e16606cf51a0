//! Access to the measured database.
//!
//! Everything the engine needs from the server is expressed as plain T-SQL
//! returning `FOR JSON PATH` rows, so a gateway only has to be able to run a
//! command and hand back the decoded JSON. The catalog queries below are
//! default methods on top of that.

mod sqlcmd;

pub use sqlcmd::SqlcmdGateway;

use crate::error::GatewayError;
use crate::types::{ObjectKind, ObjectRef};

use itertools::Itertools;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

const LIST_OBJECTS_QUERY: &str = "SET NOCOUNT ON;
SELECT o.object_id AS object_id, s.name AS schema_name, o.name AS object_name, o.type AS object_type
FROM sys.objects AS o
JOIN sys.schemas AS s ON s.schema_id = o.schema_id
JOIN sys.sql_modules AS m ON m.object_id = o.object_id
WHERE o.type IN ('P', 'FN', 'IF', 'TF', 'TR') AND o.is_ms_shipped = 0
ORDER BY s.name, o.name
FOR JSON PATH;";

/// Object ids per definition query; keeps the `IN` list and the JSON reply modest.
const FETCH_BATCH: usize = 200;

pub trait DatabaseGateway: Send + Sync {
    /// Name of the database every command runs against.
    fn database(&self) -> &str;

    fn execute(&self, command: &str) -> Result<(), GatewayError>;

    /// Runs a `FOR JSON` query; no rows at all decode as an empty array.
    fn query_json(&self, query: &str) -> Result<Value, GatewayError>;

    fn database_id(&self) -> Result<i64, GatewayError> {
        #[derive(Deserialize)]
        struct Row {
            database_id: Option<i64>,
        }
        let query = format!(
            "SET NOCOUNT ON; SELECT DB_ID(N'{}') AS database_id FOR JSON PATH, INCLUDE_NULL_VALUES;",
            quote_literal(self.database())
        );
        let rows: Vec<Row> = decode_rows(self.query_json(&query)?)?;
        rows.into_iter()
            .next()
            .and_then(|r| r.database_id)
            .ok_or_else(|| GatewayError::UnknownDatabase(self.database().to_string()))
    }

    /// User modules we know how to measure, schema qualified.
    fn list_objects(&self) -> Result<Vec<ObjectRef>, GatewayError> {
        #[derive(Deserialize)]
        struct Row {
            object_id: i64,
            schema_name: String,
            object_name: String,
            object_type: String,
        }
        let rows: Vec<Row> = decode_rows(self.query_json(LIST_OBJECTS_QUERY)?)?;
        let objects: Vec<ObjectRef> = rows
            .into_iter()
            .filter_map(|r| {
                ObjectKind::from_type_code(&r.object_type).map(|kind| ObjectRef {
                    object_id: r.object_id,
                    name: format!("{}.{}", r.schema_name, r.object_name),
                    kind,
                })
            })
            .collect();
        debug!("Found {} modules in '{}'", objects.len(), self.database());
        Ok(objects)
    }

    /// The definition exactly as stored; trace offsets point into this text.
    /// Looked up by id, so names needing brackets resolve all the same.
    fn fetch_object_source(&self, object: &ObjectRef) -> Result<String, GatewayError> {
        #[derive(Deserialize)]
        struct Row {
            definition: Option<String>,
        }
        let query = format!(
            "SET NOCOUNT ON; SELECT OBJECT_DEFINITION({}) AS definition FOR JSON PATH, INCLUDE_NULL_VALUES;",
            object.object_id
        );
        let rows: Vec<Row> = decode_rows(self.query_json(&query)?)?;
        rows.into_iter()
            .next()
            .and_then(|r| r.definition)
            .ok_or_else(|| GatewayError::MissingDefinition(object.name.clone()))
    }

    /// One result per object, in the same order. Gateways paying a fixed cost
    /// per call override this with [`fetch_sources_batched`].
    fn fetch_object_sources(&self, objects: &[ObjectRef]) -> Vec<Result<String, GatewayError>> {
        objects.iter().map(|o| self.fetch_object_source(o)).collect()
    }
}

/// Fetches definitions `FETCH_BATCH` objects per query. A batch that fails as
/// a whole is retried object by object so one bad row can't sink the rest.
pub(crate) fn fetch_sources_batched<G: DatabaseGateway + ?Sized>(
    gateway: &G,
    objects: &[ObjectRef],
) -> Vec<Result<String, GatewayError>> {
    #[derive(Deserialize)]
    struct Row {
        object_id: i64,
        definition: Option<String>,
    }
    let mut sources = Vec::with_capacity(objects.len());
    for chunk in objects.chunks(FETCH_BATCH) {
        let query = format!(
            "SET NOCOUNT ON;
SELECT m.object_id AS object_id, m.definition AS definition
FROM sys.sql_modules AS m
WHERE m.object_id IN ({})
FOR JSON PATH, INCLUDE_NULL_VALUES;",
            chunk.iter().map(|o| o.object_id).join(", ")
        );
        match gateway.query_json(&query).and_then(decode_rows::<Row>) {
            Ok(rows) => {
                let mut by_id: HashMap<i64, Option<String>> =
                    rows.into_iter().map(|r| (r.object_id, r.definition)).collect();
                sources.extend(chunk.iter().map(|o| {
                    by_id
                        .remove(&o.object_id)
                        .flatten()
                        .ok_or_else(|| GatewayError::MissingDefinition(o.name.clone()))
                }));
            }
            Err(e) => {
                debug!("Batched source fetch failed ({}), fetching one by one", e);
                sources.extend(chunk.iter().map(|o| gateway.fetch_object_source(o)));
            }
        }
    }
    sources
}

pub(crate) fn decode_rows<T: DeserializeOwned>(value: Value) -> Result<Vec<T>, GatewayError> {
    Ok(serde_json::from_value(value)?)
}

/// Escapes a value for use inside an `N'...'` literal.
pub(crate) fn quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}
