//! SQLite persistence: the readings timeseries and the actuator event log.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::relay::Relay;

/// Rows bound per `DELETE .. IN (..)` statement.
const DELETE_CHUNK: usize = 500;

/// Largest span a single `a-b` token may cover.
const MAX_ID_RANGE: i64 = 100_000;

const READING_COLUMNS: &str = "id, timestamp, air_temp, air_humidity, soil_temp, \
                               soil_raw, soil_voltage, soil_percent, lux";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct SensorReading {
    pub id: i64,
    pub timestamp: String,
    pub air_temp: Option<f64>,
    pub air_humidity: Option<f64>,
    pub soil_temp: Option<f64>,
    pub soil_raw: Option<i64>,
    pub soil_voltage: Option<f64>,
    pub soil_percent: Option<f64>,
    pub lux: Option<f64>,
}

/// A reading before it has an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewReading {
    pub timestamp: String,
    pub air_temp: Option<f64>,
    pub air_humidity: Option<f64>,
    pub soil_temp: Option<f64>,
    pub soil_raw: Option<i64>,
    pub soil_voltage: Option<f64>,
    pub soil_percent: Option<f64>,
    pub lux: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ActuatorEvent {
    pub id: i64,
    pub timestamp: String,
    pub actuator: String,
    pub action: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    On,
    Off,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::On => "ON",
            Action::Off => "OFF",
        }
    }
}

impl From<bool> for Action {
    fn from(energized: bool) -> Self {
        if energized {
            Action::On
        } else {
            Action::Off
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// The irrigation controller.
    Auto,
    /// A person, through the API.
    Manual,
    /// The control plane cleaning up after the logger.
    System,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Auto => "auto",
            EventSource::Manual => "manual",
            EventSource::System => "system",
        }
    }
}

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    Asc,
    #[default]
    Desc,
}

impl FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Order::Asc),
            "desc" => Ok(Order::Desc),
            other => Err(format!("unknown order '{other}' (asc|desc)")),
        }
    }
}

impl Order {
    fn sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// Columns a reading filter may name. Only these ever reach the SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterColumn {
    Id,
    AirTemp,
    AirHumidity,
    SoilTemp,
    SoilRaw,
    SoilVoltage,
    SoilPercent,
    Lux,
}

impl FilterColumn {
    fn sql(self) -> &'static str {
        match self {
            FilterColumn::Id => "id",
            FilterColumn::AirTemp => "air_temp",
            FilterColumn::AirHumidity => "air_humidity",
            FilterColumn::SoilTemp => "soil_temp",
            FilterColumn::SoilRaw => "soil_raw",
            FilterColumn::SoilVoltage => "soil_voltage",
            FilterColumn::SoilPercent => "soil_percent",
            FilterColumn::Lux => "lux",
        }
    }
}

impl FromStr for FilterColumn {
    type Err = String;

    /// Accepts the column names plus the sensor-prefixed names older
    /// dashboards send (`dht22_air_temp`, `ds18b20_soil_temp`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "id" => Ok(FilterColumn::Id),
            "air_temp" | "dht22_air_temp" => Ok(FilterColumn::AirTemp),
            "air_humidity" | "humidity" | "dht22_humidity" => Ok(FilterColumn::AirHumidity),
            "soil_temp" | "ds18b20_soil_temp" => Ok(FilterColumn::SoilTemp),
            "soil_raw" => Ok(FilterColumn::SoilRaw),
            "soil_voltage" => Ok(FilterColumn::SoilVoltage),
            "soil_percent" => Ok(FilterColumn::SoilPercent),
            "lux" => Ok(FilterColumn::Lux),
            other => Err(format!("unknown column '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    fn sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
        }
    }
}

impl FromStr for FilterOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" => Ok(FilterOp::Eq),
            "!=" | "<>" | "ne" => Ok(FilterOp::Ne),
            "<" | "lt" => Ok(FilterOp::Lt),
            "<=" | "le" | "lte" => Ok(FilterOp::Le),
            ">" | "gt" => Ok(FilterOp::Gt),
            ">=" | "ge" | "gte" => Ok(FilterOp::Ge),
            other => Err(format!("unknown operator '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingFilter {
    pub column: FilterColumn,
    pub op: FilterOp,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteSelection {
    Ids(BTreeSet<i64>),
    All,
}

impl fmt::Display for DeleteSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteSelection::Ids(ids) => write!(f, "{} id(s)", ids.len()),
            DeleteSelection::All => f.write_str("all rows"),
        }
    }
}

/// Parse `"1,3,5-7"` into `{1, 3, 5, 6, 7}`. Ranges are inclusive,
/// whitespace and empty tokens are ignored, duplicates collapse.
pub fn parse_id_list(input: &str) -> Result<BTreeSet<i64>> {
    let mut ids = BTreeSet::new();
    for token in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token.split_once('-') {
            Some((lo, hi)) => {
                let lo: i64 = lo
                    .trim()
                    .parse()
                    .with_context(|| format!("bad range start in '{token}'"))?;
                let hi: i64 = hi
                    .trim()
                    .parse()
                    .with_context(|| format!("bad range end in '{token}'"))?;
                if lo > hi {
                    bail!("range '{token}' runs backwards");
                }
                if hi - lo >= MAX_ID_RANGE {
                    bail!("range '{token}' spans more than {MAX_ID_RANGE} ids");
                }
                ids.extend(lo..=hi);
            }
            None => {
                let id: i64 = token
                    .parse()
                    .with_context(|| format!("bad id '{token}'"))?;
                ids.insert(id);
            }
        }
    }
    if ids.is_empty() {
        bail!("no ids given");
    }
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// `YYYY-MM-DD HH:MM:SS`, UTC.
pub fn format_timestamp(t: OffsetDateTime) -> String {
    t.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| t.unix_timestamp().to_string())
}

pub fn now_timestamp() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/greenhouse/sensors.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        // Every connection to an in-memory database is a separate database.
        let in_memory = db_url.contains(":memory:") || db_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Connect and bring the schema up to date.
    pub async fn open(db_url: &str) -> Result<Self> {
        let db = Self::connect(db_url).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &NewReading) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO readings (
              timestamp, air_temp, air_humidity, soil_temp,
              soil_raw, soil_voltage, soil_percent, lux
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.timestamp)
        .bind(r.air_temp)
        .bind(r.air_humidity)
        .bind(r.soil_temp)
        .bind(r.soil_raw)
        .bind(r.soil_voltage)
        .bind(r.soil_percent)
        .bind(r.lux)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(result.last_insert_rowid())
    }

    /// `limit == 0` returns every matching row.
    pub async fn query_readings(
        &self,
        limit: u32,
        order: Order,
        filter: Option<ReadingFilter>,
    ) -> Result<Vec<SensorReading>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        qb.push(READING_COLUMNS).push(" FROM readings");
        if let Some(f) = filter {
            qb.push(" WHERE ")
                .push(f.column.sql())
                .push(" ")
                .push(f.op.sql())
                .push(" ")
                .push_bind(f.value);
        }
        qb.push(" ORDER BY id ").push(order.sql());
        if limit > 0 {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        qb.build_query_as::<SensorReading>()
            .fetch_all(&self.pool)
            .await
            .context("query_readings failed")
    }

    pub async fn latest_reading(&self) -> Result<Option<SensorReading>> {
        Ok(self
            .query_readings(1, Order::Desc, None)
            .await?
            .into_iter()
            .next())
    }

    pub async fn count_readings(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await
            .context("count_readings failed")
    }

    /// Returns the number of rows removed. `All` also restarts the id
    /// sequence.
    pub async fn delete_readings(&self, selection: &DeleteSelection) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("begin delete failed")?;
        let mut removed = 0;

        match selection {
            DeleteSelection::All => {
                removed = sqlx::query("DELETE FROM readings")
                    .execute(&mut *tx)
                    .await
                    .context("delete all readings failed")?
                    .rows_affected();
                sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'readings'")
                    .execute(&mut *tx)
                    .await
                    .context("reset readings sequence failed")?;
            }
            DeleteSelection::Ids(ids) => {
                let ids: Vec<i64> = ids.iter().copied().collect();
                for chunk in ids.chunks(DELETE_CHUNK) {
                    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM readings WHERE id IN (");
                    let mut list = qb.separated(", ");
                    for id in chunk {
                        list.push_bind(*id);
                    }
                    list.push_unseparated(")");
                    removed += qb
                        .build()
                        .execute(&mut *tx)
                        .await
                        .context("delete readings by id failed")?
                        .rows_affected();
                }
            }
        }

        tx.commit().await.context("commit delete failed")?;
        tracing::info!(%selection, removed, "readings deleted");
        Ok(removed)
    }

    // ----------------------------
    // Actuator events
    // ----------------------------

    pub async fn insert_actuator_event(
        &self,
        relay: Relay,
        action: Action,
        source: EventSource,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO actuator_events (timestamp, actuator, action, source)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(now_timestamp())
        .bind(relay.name())
        .bind(action.as_str())
        .bind(source.as_str())
        .execute(&self.pool)
        .await
        .context("insert_actuator_event failed")?;
        Ok(result.last_insert_rowid())
    }

    /// Newest first. `limit == 0` returns the whole log.
    pub async fn query_actuator_events(&self, limit: u32) -> Result<Vec<ActuatorEvent>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, timestamp, actuator, action, source FROM actuator_events ORDER BY id DESC",
        );
        if limit > 0 {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }
        qb.build_query_as::<ActuatorEvent>()
            .fetch_all(&self.pool)
            .await
            .context("query_actuator_events failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn memory_db() -> Db {
        Db::open("sqlite::memory:").await.unwrap()
    }

    fn reading(soil_percent: f64) -> NewReading {
        NewReading {
            timestamp: "2024-05-01 12:00:00".to_string(),
            air_temp: Some(21.5),
            soil_percent: Some(soil_percent),
            ..Default::default()
        }
    }

    async fn seed(db: &Db, n: usize) {
        for i in 0..n {
            db.insert_reading(&reading(i as f64 * 10.0)).await.unwrap();
        }
    }

    async fn ids(db: &Db) -> Vec<i64> {
        db.query_readings(0, Order::Asc, None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    // -- Id lists ---------------------------------------------------------

    #[test]
    fn id_list_with_ranges() {
        let ids = parse_id_list("1,3,5-7").unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 3, 5, 6, 7]);
    }

    #[test]
    fn id_list_tolerates_whitespace_and_duplicates() {
        let ids = parse_id_list(" 2 , 2, 1 - 3 ,").unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn id_list_rejects_garbage() {
        assert!(parse_id_list("1,x").is_err());
        assert!(parse_id_list("7-5").is_err());
        assert!(parse_id_list("3-").is_err());
        assert!(parse_id_list("").is_err());
        assert!(parse_id_list("1-10000000").is_err());
    }

    // -- Readings ---------------------------------------------------------

    #[tokio::test]
    async fn insert_and_query_round_trip() {
        let db = memory_db().await;
        let id = db
            .insert_reading(&NewReading {
                timestamp: "2024-05-01 12:00:00".to_string(),
                air_temp: Some(21.5),
                air_humidity: Some(55.0),
                soil_temp: None,
                soil_raw: Some(8000),
                soil_voltage: Some(1.0),
                soil_percent: Some(42.86),
                lux: Some(120.5),
            })
            .await
            .unwrap();
        assert_eq!(id, 1);

        let rows = db.query_readings(10, Order::Desc, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].soil_raw, Some(8000));
        assert_eq!(rows[0].soil_temp, None);
        assert_eq!(db.count_readings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn limit_and_order() {
        let db = memory_db().await;
        seed(&db, 5).await;

        let newest = db.query_readings(2, Order::Desc, None).await.unwrap();
        assert_eq!(newest.iter().map(|r| r.id).collect::<Vec<_>>(), vec![5, 4]);

        let all = db.query_readings(0, Order::Asc, None).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].id, 1);

        assert_eq!(db.latest_reading().await.unwrap().map(|r| r.id), Some(5));
    }

    #[tokio::test]
    async fn filter_is_applied() {
        let db = memory_db().await;
        seed(&db, 5).await; // soil_percent 0, 10, 20, 30, 40

        let dry = db
            .query_readings(
                0,
                Order::Asc,
                Some(ReadingFilter {
                    column: "soil_percent".parse().unwrap(),
                    op: "<".parse().unwrap(),
                    value: 25.0,
                }),
            )
            .await
            .unwrap();
        assert_eq!(dry.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn filter_parts_are_allow_listed() {
        assert!("soil_percent; DROP TABLE readings".parse::<FilterColumn>().is_err());
        assert!("LIKE".parse::<FilterOp>().is_err());
        assert_eq!("dht22_air_temp".parse::<FilterColumn>(), Ok(FilterColumn::AirTemp));
        assert_eq!(">=".parse::<FilterOp>(), Ok(FilterOp::Ge));
        assert_eq!("ASC".parse::<Order>(), Ok(Order::Asc));
    }

    // -- Deletion ---------------------------------------------------------

    #[tokio::test]
    async fn delete_by_id_list() {
        let db = memory_db().await;
        seed(&db, 8).await;

        let removed = db
            .delete_readings(&DeleteSelection::Ids(parse_id_list("1,3,5-7").unwrap()))
            .await
            .unwrap();
        assert_eq!(removed, 5);
        assert_eq!(ids(&db).await, vec![2, 4, 8]);
    }

    #[tokio::test]
    async fn delete_missing_ids_is_not_an_error() {
        let db = memory_db().await;
        seed(&db, 2).await;
        let removed = db
            .delete_readings(&DeleteSelection::Ids(parse_id_list("40-45").unwrap()))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(db.count_readings().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_all_resets_sequence() {
        let db = memory_db().await;
        seed(&db, 3).await;

        assert_eq!(db.delete_readings(&DeleteSelection::All).await.unwrap(), 3);
        assert_eq!(db.count_readings().await.unwrap(), 0);

        let id = db.insert_reading(&reading(5.0)).await.unwrap();
        assert_eq!(id, 1, "id sequence should restart after delete-all");
    }

    // -- Actuator events --------------------------------------------------

    #[tokio::test]
    async fn actuator_events_newest_first() {
        let db = memory_db().await;
        db.insert_actuator_event(Relay::Pump, Action::On, EventSource::Auto)
            .await
            .unwrap();
        db.insert_actuator_event(Relay::Pump, Action::Off, EventSource::Auto)
            .await
            .unwrap();
        db.insert_actuator_event(Relay::Light, Action::On, EventSource::Manual)
            .await
            .unwrap();

        let events = db.query_actuator_events(2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].actuator, "light");
        assert_eq!(events[0].source, "manual");
        assert_eq!(events[1].action, "OFF");

        assert_eq!(db.query_actuator_events(0).await.unwrap().len(), 3);
    }

    #[test]
    fn timestamp_format() {
        let t = time::macros::datetime!(2024-03-09 07:05:01 UTC);
        assert_eq!(format_timestamp(t), "2024-03-09 07:05:01");
    }
}
