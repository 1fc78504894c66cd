//! SQL Server source reader over Tiberius with bb8 pooling.

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::{EtlError, Result};
use crate::schema::TableSpec;
use crate::source::{RawValue, SourceReader, SourceRow};

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pooled SQL Server reader.
pub struct MssqlSource {
    pool: Pool<TiberiusConnectionManager>,
    config: SourceConfig,
}

impl MssqlSource {
    pub async fn new(config: SourceConfig) -> Result<Self> {
        Self::with_max_connections(config, 4).await
    }

    pub async fn with_max_connections(config: SourceConfig, max_size: u32) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .await
            .map_err(|e| EtlError::pool(e.to_string(), "building source pool"))?;

        info!(
            "Connected to SQL Server source: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self { pool, config })
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| EtlError::pool(e.to_string(), "getting source connection"))
    }
}

#[async_trait]
impl SourceReader for MssqlSource {
    async fn fetch(&self, spec: &TableSpec) -> Result<Vec<SourceRow>> {
        let sql = spec
            .source
            .build_query()
            .ok_or_else(|| EtlError::catalog(format!("table '{}' has no source", spec.name)))?;

        debug!(table = %spec.name, %sql, "extracting");

        let mut client = self.get_client().await?;
        let stream = client.simple_query(&sql).await?;
        let rows = stream.into_first_result().await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(convert_row(&row));
        }

        debug!(table = %spec.name, rows = out.len(), "extracted");
        Ok(out)
    }

    async fn probe(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        debug!(
            "Source probe OK: {}:{}",
            self.config.host, self.config.port
        );
        Ok(())
    }

    fn source_type(&self) -> &str {
        "mssql"
    }
}

/// Convert one Tiberius row into column-name/value pairs.
fn convert_row(row: &Row) -> SourceRow {
    let names: Vec<String> = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let mut columns = Vec::with_capacity(names.len());
    for (idx, data) in row.cells().enumerate() {
        let value = convert_value(row, idx, data.1);
        columns.push((names[idx].clone(), value));
    }

    SourceRow::new(columns)
}

/// Convert a single cell. Temporal variants go through the typed getters so
/// Tiberius handles the wire encodings; everything else maps directly.
fn convert_value(row: &Row, idx: usize, data: &ColumnData<'_>) -> RawValue {
    match data {
        ColumnData::Bit(v) => v.map(RawValue::Bool).unwrap_or(RawValue::Null),
        ColumnData::U8(v) => v.map(|n| RawValue::I64(n as i64)).unwrap_or(RawValue::Null),
        ColumnData::I16(v) => v.map(|n| RawValue::I64(n as i64)).unwrap_or(RawValue::Null),
        ColumnData::I32(v) => v.map(|n| RawValue::I64(n as i64)).unwrap_or(RawValue::Null),
        ColumnData::I64(v) => v.map(RawValue::I64).unwrap_or(RawValue::Null),
        ColumnData::F32(v) => v.map(|n| RawValue::F64(n as f64)).unwrap_or(RawValue::Null),
        ColumnData::F64(v) => v.map(RawValue::F64).unwrap_or(RawValue::Null),
        ColumnData::Guid(v) => v.map(RawValue::Uuid).unwrap_or(RawValue::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| RawValue::Text(s.to_string()))
            .unwrap_or(RawValue::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| RawValue::Bytes(b.to_vec()))
            .unwrap_or(RawValue::Null),
        ColumnData::Numeric(_) => row
            .get::<rust_decimal::Decimal, _>(idx)
            .map(RawValue::Decimal)
            .unwrap_or(RawValue::Null),
        ColumnData::Date(_) => row
            .get::<NaiveDate, _>(idx)
            .map(RawValue::Date)
            .unwrap_or(RawValue::Null),
        ColumnData::DateTime(_) | ColumnData::DateTime2(_) | ColumnData::SmallDateTime(_) => row
            .get::<NaiveDateTime, _>(idx)
            .map(RawValue::DateTime)
            .unwrap_or(RawValue::Null),
        ColumnData::DateTimeOffset(_) => row
            .get::<DateTime<Utc>, _>(idx)
            .map(RawValue::DateTimeUtc)
            .unwrap_or(RawValue::Null),
        ColumnData::Time(_) => row
            .get::<chrono::NaiveTime, _>(idx)
            .map(|t| RawValue::Text(t.to_string()))
            .unwrap_or(RawValue::Null),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| RawValue::Text(x.to_string()))
            .unwrap_or(RawValue::Null),
    }
}
