/// Seams to the wire-protocol client.
///
/// The socket-level client is not part of this crate. Everything here talks
/// to it through `ConnectionProxy` (one open connection) and
/// `ConnectionHandler` (opens connections to a given host).
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DriverResult;
use crate::host::HostInfo;

/// One result row, columns as optional text
pub type Row = Vec<Option<String>>;

/// An open connection to one cluster instance
#[async_trait]
pub trait ConnectionProxy: Send + Sync {
    /// Run a query and fetch every row
    async fn query(&self, sql: &str) -> DriverResult<Vec<Row>>;

    /// Cheap liveness round-trip
    async fn ping(&self) -> DriverResult<()>;

    fn is_connected(&self) -> bool;

    /// Orderly close
    async fn close(&self);

    /// Abrupt socket shutdown, used when a monitor declares the node dead.
    /// Must not block.
    fn close_socket(&self);
}

/// Connection settings handed to the wire-protocol client
#[derive(Debug, Clone, PartialEq)]
pub struct DataSource {
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub connect_timeout: Duration,
    pub network_timeout: Duration,
}

impl DataSource {
    /// Same credentials with different timeouts, used for monitoring connections
    pub fn with_timeouts(&self, connect_timeout: Duration, network_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            network_timeout,
            ..self.clone()
        }
    }
}

impl Default for DataSource {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            database: None,
            connect_timeout: Duration::from_secs(30),
            network_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens connections to cluster instances
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// `None` on an ordinary connect failure; never panics for one
    async fn connect(
        &self,
        host: &HostInfo,
        settings: Option<&DataSource>,
    ) -> Option<Arc<dyn ConnectionProxy>>;
}

/// Read the first column of the first row as text
pub async fn query_scalar(connection: &dyn ConnectionProxy, sql: &str) -> DriverResult<Option<String>> {
    let rows = connection.query(sql).await?;
    Ok(rows
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnection;

    #[tokio::test]
    async fn test_query_scalar() {
        let conn = MockConnection::new("db");
        conn.set_rows(vec![vec![Some("instance-1".to_string()), None]]);
        let value = query_scalar(&conn, "SELECT @@aurora_server_id").await.unwrap();
        assert_eq!(value.as_deref(), Some("instance-1"));

        conn.set_rows(Vec::new());
        assert_eq!(query_scalar(&conn, "SELECT 1").await.unwrap(), None);
    }

    #[test]
    fn test_datasource_with_timeouts() {
        let ds = DataSource {
            user: Some("admin".to_string()),
            ..Default::default()
        };
        let monitoring = ds.with_timeouts(Duration::from_secs(3), Duration::from_secs(3));
        assert_eq!(monitoring.user.as_deref(), Some("admin"));
        assert_eq!(monitoring.connect_timeout, Duration::from_secs(3));
    }
}
