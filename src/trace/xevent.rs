//! Extended Events backed trace source.
//!
//! The session captures `sp_statement_starting` for one database into a
//! ring buffer target, which is shredded into JSON rows on read.

use super::{BufferLoss, TraceSource};
use crate::config::TraceScope;
use crate::error::{GatewayError, SessionError};
use crate::gateway::{decode_rows, quote_literal, DatabaseGateway};
use crate::types::RawEvent;

use log::debug;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub struct XEventTrace {
    gateway: Arc<dyn DatabaseGateway>,
    name: String,
    scope: TraceScope,
    latency_secs: u64,
}

impl XEventTrace {
    pub fn new(gateway: Arc<dyn DatabaseGateway>, scope: TraceScope, latency: Duration) -> Self {
        XEventTrace {
            gateway,
            name: format!("sqlcover_{:016x}", rand::random::<u64>()),
            scope,
            // MAX_DISPATCH_LATENCY only takes whole seconds
            latency_secs: latency.as_millis().div_ceil(1000).max(1) as u64,
        }
    }

    fn on_clause(&self) -> &'static str {
        match self.scope {
            TraceScope::Server => "SERVER",
            TraceScope::Database => "DATABASE",
        }
    }

    fn create_command(&self, database_id: Option<i64>) -> String {
        // database scoped sessions only ever see their own database
        let predicate = match database_id {
            Some(id) => format!("(WHERE ([sqlserver].[database_id]=({})))", id),
            None => String::new(),
        };
        format!(
            "CREATE EVENT SESSION [{name}] ON {on}
ADD EVENT sqlserver.sp_statement_starting(
    ACTION(sqlserver.database_id)
    {predicate})
ADD TARGET package0.ring_buffer(SET max_memory = 102400)
WITH (EVENT_RETENTION_MODE = NO_EVENT_LOSS, MAX_DISPATCH_LATENCY = {latency} SECONDS,
      MAX_EVENT_SIZE = 0 KB, TRACK_CAUSALITY = OFF, STARTUP_STATE = OFF);",
            name = self.name,
            on = self.on_clause(),
            predicate = predicate,
            latency = self.latency_secs,
        )
    }

    fn state_command(&self, state: &str) -> String {
        format!(
            "ALTER EVENT SESSION [{}] ON {} STATE = {};",
            self.name,
            self.on_clause(),
            state
        )
    }

    fn running_views(&self) -> (&'static str, &'static str) {
        match self.scope {
            TraceScope::Server => ("sys.dm_xe_sessions", "sys.dm_xe_session_targets"),
            TraceScope::Database => (
                "sys.dm_xe_database_sessions",
                "sys.dm_xe_database_session_targets",
            ),
        }
    }

    /// The session's ring buffer as one xml value, exposed as CTE `target`.
    fn target_cte(&self) -> String {
        let (sessions, targets) = self.running_views();
        format!(
            "WITH target AS (
    SELECT CAST(t.target_data AS xml) AS data
    FROM {targets} AS t
    JOIN {sessions} AS s ON s.address = t.event_session_address
    WHERE s.name = N'{name}' AND t.target_name = N'ring_buffer'
)",
            targets = targets,
            sessions = sessions,
            name = quote_literal(&self.name),
        )
    }

    fn read_query(&self) -> String {
        format!(
            "SET NOCOUNT ON;
{target}
SELECT
    e.value('(data[@name=\"object_id\"]/value)[1]', 'bigint') AS object_id,
    e.value('(data[@name=\"offset\"]/value)[1]', 'bigint') AS offset,
    e.value('(data[@name=\"offset_end\"]/value)[1]', 'bigint') AS offset_end,
    e.value('@timestamp', 'nvarchar(64)') AS timestamp
FROM target
CROSS APPLY target.data.nodes('/RingBufferTarget/event') AS x(e)
WHERE e.value('(data[@name=\"object_id\"]/value)[1]', 'bigint') IS NOT NULL
FOR JSON PATH;",
            target = self.target_cte(),
        )
    }

    /// `target_data` is cut at about 4 MB and the buffer itself drops the
    /// oldest events once full; the root element records both.
    fn loss_query(&self) -> String {
        format!(
            "SET NOCOUNT ON;
{target}
SELECT
    r.value('@truncated', 'int') AS truncated,
    r.value('@droppedCount', 'bigint') AS dropped_count
FROM target
CROSS APPLY target.data.nodes('/RingBufferTarget') AS x(r)
FOR JSON PATH;",
            target = self.target_cte(),
        )
    }

    fn lifecycle(&self, action: &'static str, source: GatewayError) -> SessionError {
        SessionError::Lifecycle {
            session: self.name.clone(),
            action,
            source,
        }
    }
}

impl TraceSource for XEventTrace {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), SessionError> {
        let create = |source| SessionError::Create {
            session: self.name.clone(),
            source,
        };
        let database_id = match self.scope {
            TraceScope::Server => Some(self.gateway.database_id().map_err(create)?),
            TraceScope::Database => None,
        };
        self.gateway
            .execute(&self.create_command(database_id))
            .map_err(create)?;
        self.gateway
            .execute(&self.state_command("START"))
            .map_err(create)?;
        debug!(
            "Started event session '{}' on {} (latency {}s)",
            self.name,
            self.on_clause(),
            self.latency_secs
        );
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Vec<RawEvent>, SessionError> {
        let rows = self
            .gateway
            .query_json(&self.read_query())
            .map_err(|e| self.lifecycle("read", e))?;
        decode_rows(rows).map_err(|e| self.lifecycle("read", e))
    }

    fn read_loss(&mut self) -> Result<BufferLoss, SessionError> {
        #[derive(Deserialize)]
        struct Row {
            truncated: Option<i64>,
            dropped_count: Option<i64>,
        }
        let rows: Vec<Row> = self
            .gateway
            .query_json(&self.loss_query())
            .and_then(decode_rows)
            .map_err(|e| self.lifecycle("read", e))?;
        Ok(rows
            .into_iter()
            .next()
            .map(|r| BufferLoss {
                truncated: r.truncated.unwrap_or(0) != 0,
                dropped: r.dropped_count.unwrap_or(0).max(0) as u64,
            })
            .unwrap_or_default())
    }

    fn stop(&mut self) -> Result<(), SessionError> {
        let (sessions, _) = self.running_views();
        let command = format!(
            "IF EXISTS (SELECT 1 FROM {} WHERE name = N'{}') {}",
            sessions,
            quote_literal(&self.name),
            self.state_command("STOP")
        );
        self.gateway
            .execute(&command)
            .map_err(|e| self.lifecycle("stopped", e))
    }

    fn drop_session(&mut self) -> Result<(), SessionError> {
        let catalog = match self.scope {
            TraceScope::Server => "sys.server_event_sessions",
            TraceScope::Database => "sys.database_event_sessions",
        };
        let command = format!(
            "IF EXISTS (SELECT 1 FROM {} WHERE name = N'{}') DROP EVENT SESSION [{}] ON {};",
            catalog,
            quote_literal(&self.name),
            self.name,
            self.on_clause()
        );
        self.gateway
            .execute(&command)
            .map_err(|e| self.lifecycle("dropped", e))
    }
}
