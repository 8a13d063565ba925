//! SQLite persistence layer (the `Store`).
//!
//! A thin wrapper around a `sqlx::SqlitePool` with one function per entity
//! per operation, WAL journal mode, and a
//! migrations directory applied via `sqlx::migrate!`. Each entity gets an
//! intermediate `*Row` type (plain column types sqlx can decode directly)
//! and a fallible conversion into the typed domain record — a "row →
//! record, record → positional params" codec, rather than dynamic-dictionary
//! reflection.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::GardenError;
use crate::models::{
    Activation, ActivationOwner, Client, Consequence, Element, Measurement, Relay, Rule,
    RuleLimit, Schedule, Sensor, Slave, SlaveId,
};

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

fn parse_uuid(raw: &str) -> Result<Uuid, GardenError> {
    Uuid::parse_str(raw)
        .map_err(|e| GardenError::ConfigurationFault(format!("invalid uuid {raw:?}: {e}")))
}

impl Store {
    pub async fn connect(db_path: &str) -> Result<Store, GardenError> {
        let options = SqliteConnectOptions::from_str(db_path)
            .map_err(|e| GardenError::FatalHostFault(format!("invalid db path {db_path:?}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| GardenError::FatalHostFault(format!("cannot open database: {e}")))?;

        Ok(Store { pool })
    }

    pub async fn migrate(&self) -> Result<(), GardenError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| GardenError::FatalHostFault(format!("migration failed: {e}")))
    }

    // -- client --------------------------------------------------------

    pub async fn load_all_clients(&self) -> Result<Vec<Client>, GardenError> {
        let rows = sqlx::query("SELECT uuid, name FROM client")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Client {
                    uuid: parse_uuid(r.get::<String, _>("uuid").as_str())?,
                    name: r.get("name"),
                })
            })
            .collect()
    }

    pub async fn insert_client(&self, client: &Client) -> Result<(), GardenError> {
        sqlx::query("INSERT INTO client (uuid, name) VALUES (?, ?)")
            .bind(client.uuid.to_string())
            .bind(&client.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- slave -----------------------------------------------------------

    pub async fn load_all_slaves(&self) -> Result<Vec<Slave>, GardenError> {
        let rows = sqlx::query("SELECT uuid, nickname, connected, last_seen FROM slave")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Slave {
                    uuid: SlaveId::new(r.get::<String, _>("uuid"))?,
                    nickname: r.get("nickname"),
                    connected: r.get("connected"),
                    last_seen: r.get("last_seen"),
                })
            })
            .collect()
    }

    pub async fn insert_slave(&self, slave: &Slave) -> Result<(), GardenError> {
        sqlx::query(
            "INSERT INTO slave (uuid, nickname, connected, last_seen) VALUES (?, ?, ?, ?)",
        )
        .bind(slave.uuid.to_string())
        .bind(&slave.nickname)
        .bind(slave.connected)
        .bind(slave.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets `connected` and stamps `last_seen`. A failure here is
    /// loggable-and-continue, never fatal to the tick.
    pub async fn update_slave_connected(
        &self,
        uuid: &SlaveId,
        connected: bool,
        last_seen: OffsetDateTime,
    ) -> Result<(), GardenError> {
        sqlx::query("UPDATE slave SET connected = ?, last_seen = ? WHERE uuid = ?")
            .bind(connected)
            .bind(last_seen)
            .bind(uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- sensor ------------------------------------------------------------

    pub async fn load_all_sensors(&self) -> Result<Vec<Sensor>, GardenError> {
        let rows = sqlx::query(
            "SELECT uuid, slave_uuid, active, digital, pin, driver, measurement_type FROM sensor",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Sensor {
                    uuid: parse_uuid(r.get::<String, _>("uuid").as_str())?,
                    slave_uuid: SlaveId::new(r.get::<String, _>("slave_uuid"))?,
                    active: r.get("active"),
                    digital: r.get("digital"),
                    pin: r.get::<i64, _>("pin") as i32,
                    driver: r.get("driver"),
                    measurement_type: r.get("measurement_type"),
                })
            })
            .collect()
    }

    pub async fn insert_sensor(&self, sensor: &Sensor) -> Result<(), GardenError> {
        sqlx::query(
            "INSERT INTO sensor (uuid, slave_uuid, active, digital, pin, driver, measurement_type) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(sensor.uuid.to_string())
        .bind(sensor.slave_uuid.to_string())
        .bind(sensor.active)
        .bind(sensor.digital)
        .bind(sensor.pin as i64)
        .bind(&sensor.driver)
        .bind(&sensor.measurement_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- relay ---------------------------------------------------------

    pub async fn load_all_relays(&self) -> Result<Vec<Relay>, GardenError> {
        let rows = sqlx::query("SELECT uuid, slave_uuid, active, manual, pin FROM relay")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Relay::new(
                    parse_uuid(r.get::<String, _>("uuid").as_str())?,
                    SlaveId::new(r.get::<String, _>("slave_uuid"))?,
                    r.get("active"),
                    r.get("manual"),
                    r.get::<i64, _>("pin") as i32,
                ))
            })
            .collect()
    }

    pub async fn insert_relay(&self, relay: &Relay) -> Result<(), GardenError> {
        sqlx::query("INSERT INTO relay (uuid, slave_uuid, active, manual, pin) VALUES (?, ?, ?, ?, ?)")
            .bind(relay.uuid.to_string())
            .bind(relay.slave_uuid.to_string())
            .bind(relay.active)
            .bind(relay.manual)
            .bind(relay.pin as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- schedule ------------------------------------------------------

    pub async fn load_all_schedules(&self) -> Result<Vec<Schedule>, GardenError> {
        let rows = sqlx::query("SELECT uuid, active, schedule_start, schedule_end FROM schedule")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Schedule {
                    uuid: parse_uuid(r.get::<String, _>("uuid").as_str())?,
                    active: r.get("active"),
                    schedule_start: r.get::<i64, _>("schedule_start") as i32,
                    schedule_end: r.get::<i64, _>("schedule_end") as i32,
                })
            })
            .collect()
    }

    pub async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), GardenError> {
        sqlx::query(
            "INSERT INTO schedule (uuid, active, schedule_start, schedule_end) VALUES (?, ?, ?, ?)",
        )
        .bind(schedule.uuid.to_string())
        .bind(schedule.active)
        .bind(schedule.schedule_start as i64)
        .bind(schedule.schedule_end as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- rule ------------------------------------------------------------

    pub async fn load_all_rules(&self) -> Result<Vec<Rule>, GardenError> {
        let rows = sqlx::query("SELECT uuid, schedule_uuid, logic_type FROM rule")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Rule {
                    uuid: parse_uuid(r.get::<String, _>("uuid").as_str())?,
                    schedule_uuid: parse_uuid(r.get::<String, _>("schedule_uuid").as_str())?,
                    logic_type: r.get("logic_type"),
                    element_tracks: Default::default(),
                    current_activation: None,
                })
            })
            .collect()
    }

    pub async fn insert_rule(&self, rule: &Rule) -> Result<(), GardenError> {
        sqlx::query("INSERT INTO rule (uuid, schedule_uuid, logic_type) VALUES (?, ?, ?)")
            .bind(rule.uuid.to_string())
            .bind(rule.schedule_uuid.to_string())
            .bind(&rule.logic_type)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- element -----------------------------------------------------------

    pub async fn load_all_elements(&self) -> Result<Vec<Element>, GardenError> {
        let rows = sqlx::query(
            "SELECT uuid, rule_uuid, sensor_uuid, min_value, max_value, target_value FROM element",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Element {
                    uuid: parse_uuid(r.get::<String, _>("uuid").as_str())?,
                    rule_uuid: parse_uuid(r.get::<String, _>("rule_uuid").as_str())?,
                    sensor_uuid: parse_uuid(r.get::<String, _>("sensor_uuid").as_str())?,
                    min_value: r.get("min_value"),
                    max_value: r.get("max_value"),
                    target_value: r.get("target_value"),
                })
            })
            .collect()
    }

    pub async fn insert_element(&self, element: &Element) -> Result<(), GardenError> {
        sqlx::query(
            "INSERT INTO element (uuid, rule_uuid, sensor_uuid, min_value, max_value, target_value) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(element.uuid.to_string())
        .bind(element.rule_uuid.to_string())
        .bind(element.sensor_uuid.to_string())
        .bind(element.min_value)
        .bind(element.max_value)
        .bind(element.target_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- consequence -------------------------------------------------------

    pub async fn load_all_consequences(&self) -> Result<Vec<Consequence>, GardenError> {
        let rows = sqlx::query("SELECT uuid, rule_uuid, relay_uuid FROM consequence")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Consequence {
                    uuid: parse_uuid(r.get::<String, _>("uuid").as_str())?,
                    rule_uuid: parse_uuid(r.get::<String, _>("rule_uuid").as_str())?,
                    relay_uuid: parse_uuid(r.get::<String, _>("relay_uuid").as_str())?,
                })
            })
            .collect()
    }

    pub async fn insert_consequence(&self, consequence: &Consequence) -> Result<(), GardenError> {
        sqlx::query("INSERT INTO consequence (uuid, rule_uuid, relay_uuid) VALUES (?, ?, ?)")
            .bind(consequence.uuid.to_string())
            .bind(consequence.rule_uuid.to_string())
            .bind(consequence.relay_uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- rule_limit -------------------------------------------------------

    pub async fn load_all_rule_limits(&self) -> Result<Vec<RuleLimit>, GardenError> {
        let rows = sqlx::query("SELECT uuid, rule_uuid, every_seconds, period_seconds FROM rule_limit")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(RuleLimit {
                    uuid: parse_uuid(r.get::<String, _>("uuid").as_str())?,
                    rule_uuid: parse_uuid(r.get::<String, _>("rule_uuid").as_str())?,
                    every: r.get("every_seconds"),
                    period: r.get("period_seconds"),
                })
            })
            .collect()
    }

    pub async fn insert_rule_limit(&self, limit: &RuleLimit) -> Result<(), GardenError> {
        sqlx::query(
            "INSERT INTO rule_limit (uuid, rule_uuid, every_seconds, period_seconds) VALUES (?, ?, ?, ?)",
        )
        .bind(limit.uuid.to_string())
        .bind(limit.rule_uuid.to_string())
        .bind(limit.every)
        .bind(limit.period)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- activation --------------------------------------------------------

    fn activation_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Activation, GardenError> {
        let relay_uuid: Option<String> = row.get("relay_uuid");
        let rule_uuid: Option<String> = row.get("rule_uuid");
        let owner = match (relay_uuid, rule_uuid) {
            (Some(r), None) => ActivationOwner::Relay(parse_uuid(&r)?),
            (None, Some(r)) => ActivationOwner::Rule(parse_uuid(&r)?),
            _ => {
                return Err(GardenError::ConfigurationFault(
                    "activation row must have exactly one of relay_uuid/rule_uuid".into(),
                ))
            }
        };
        Ok(Activation {
            uuid: parse_uuid(row.get::<String, _>("uuid").as_str())?,
            owner,
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            last_update: row.get("last_update"),
        })
    }

    pub async fn load_all_activations(&self) -> Result<Vec<Activation>, GardenError> {
        let rows = sqlx::query(
            "SELECT uuid, relay_uuid, rule_uuid, start_time, end_time, last_update FROM activation",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::activation_from_row).collect()
    }

    pub async fn load_open_activations(&self) -> Result<Vec<Activation>, GardenError> {
        let rows = sqlx::query(
            "SELECT uuid, relay_uuid, rule_uuid, start_time, end_time, last_update \
             FROM activation WHERE end_time IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::activation_from_row).collect()
    }

    /// Activations (of either owner kind) whose `start_time` falls at or
    /// after `since`.
    pub async fn load_activations_since(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<Activation>, GardenError> {
        let rows = sqlx::query(
            "SELECT uuid, relay_uuid, rule_uuid, start_time, end_time, last_update \
             FROM activation WHERE start_time >= ?",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::activation_from_row).collect()
    }

    pub async fn insert_activation(&self, activation: &Activation) -> Result<(), GardenError> {
        sqlx::query(
            "INSERT INTO activation (uuid, relay_uuid, rule_uuid, start_time, end_time, last_update) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(activation.uuid.to_string())
        .bind(activation.owner.relay_uuid().map(|u| u.to_string()))
        .bind(activation.owner.rule_uuid().map(|u| u.to_string()))
        .bind(activation.start_time)
        .bind(activation.end_time)
        .bind(activation.last_update)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a close (or any `last_update` bump) for an existing
    /// activation. A failure here is a `PersistenceFault`; the caller
    /// aborts this entity's transition for the tick and retries next tick
    /// rather than losing the in-memory state.
    pub async fn update_activation(&self, activation: &Activation) -> Result<(), GardenError> {
        sqlx::query("UPDATE activation SET end_time = ?, last_update = ? WHERE uuid = ?")
            .bind(activation.end_time)
            .bind(activation.last_update)
            .bind(activation.uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- measurement ---------------------------------------------------

    /// Optional: surrounding systems are the primary writer of measurement
    /// history; the core may record a reading but is not required to.
    pub async fn insert_measurement(&self, measurement: &Measurement) -> Result<(), GardenError> {
        sqlx::query(
            "INSERT INTO measurement (uuid, sensor_uuid, timestamp, value) VALUES (?, ?, ?, ?)",
        )
        .bind(measurement.uuid.to_string())
        .bind(measurement.sensor_uuid.to_string())
        .bind(measurement.timestamp)
        .bind(measurement.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    async fn memory_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    /// A valid 36-character slave identity for tests. An actual UUID
    /// satisfies `SlaveId`'s length check just as well as a non-UUID one
    /// would (see `models::tests`, which pins the non-UUID case).
    fn test_slave_id() -> SlaveId {
        SlaveId::new(Uuid::new_v4().to_string()).unwrap()
    }

    #[tokio::test]
    async fn slave_round_trips_through_insert_and_load() {
        let store = memory_store().await;
        let slave = Slave {
            uuid: test_slave_id(),
            nickname: "bed-1".into(),
            connected: true,
            last_seen: OffsetDateTime::now_utc(),
        };
        store.insert_slave(&slave).await.unwrap();

        let loaded = store.load_all_slaves().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].uuid, slave.uuid);
        assert!(loaded[0].connected);
    }

    #[tokio::test]
    async fn update_slave_connected_flips_flag() {
        let store = memory_store().await;
        let slave = Slave {
            uuid: test_slave_id(),
            nickname: "bed-1".into(),
            connected: false,
            last_seen: OffsetDateTime::now_utc(),
        };
        store.insert_slave(&slave).await.unwrap();
        store
            .update_slave_connected(&slave.uuid, true, OffsetDateTime::now_utc())
            .await
            .unwrap();

        let loaded = store.load_all_slaves().await.unwrap();
        assert!(loaded[0].connected);
    }

    #[tokio::test]
    async fn activation_rejects_dual_ownership_at_the_schema_level() {
        let store = memory_store().await;
        let uuid = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let result = sqlx::query(
            "INSERT INTO activation (uuid, relay_uuid, rule_uuid, start_time, end_time, last_update) \
             VALUES (?, NULL, NULL, ?, NULL, ?)",
        )
        .bind(uuid.to_string())
        .bind(now)
        .bind(now)
        .execute(&store.pool)
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn open_activation_round_trip_and_close() {
        let store = memory_store().await;
        let slave = Slave {
            uuid: test_slave_id(),
            nickname: "bed-1".into(),
            connected: true,
            last_seen: OffsetDateTime::now_utc(),
        };
        store.insert_slave(&slave).await.unwrap();
        let relay = Relay::new(Uuid::new_v4(), slave.uuid.clone(), true, false, 2);
        store.insert_relay(&relay).await.unwrap();

        let now = OffsetDateTime::now_utc();
        let mut activation = Activation {
            uuid: Uuid::new_v4(),
            owner: ActivationOwner::Relay(relay.uuid),
            start_time: now,
            end_time: None,
            last_update: now,
        };
        store.insert_activation(&activation).await.unwrap();

        let open = store.load_open_activations().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].owner, ActivationOwner::Relay(relay.uuid));

        activation.terminate(Some(now));
        store.update_activation(&activation).await.unwrap();

        let open_after = store.load_open_activations().await.unwrap();
        assert!(open_after.is_empty());
    }

    #[tokio::test]
    async fn activations_since_excludes_older_rows() {
        let store = memory_store().await;
        let slave = Slave {
            uuid: test_slave_id(),
            nickname: "bed-1".into(),
            connected: true,
            last_seen: OffsetDateTime::now_utc(),
        };
        store.insert_slave(&slave).await.unwrap();
        let relay = Relay::new(Uuid::new_v4(), slave.uuid.clone(), true, false, 2);
        store.insert_relay(&relay).await.unwrap();

        let now = OffsetDateTime::now_utc();
        let old = Activation {
            uuid: Uuid::new_v4(),
            owner: ActivationOwner::Relay(relay.uuid),
            start_time: now - time::Duration::hours(2),
            end_time: Some(now - time::Duration::hours(1)),
            last_update: now - time::Duration::hours(1),
        };
        let recent = Activation {
            uuid: Uuid::new_v4(),
            owner: ActivationOwner::Relay(relay.uuid),
            start_time: now - time::Duration::minutes(5),
            end_time: None,
            last_update: now - time::Duration::minutes(5),
        };
        store.insert_activation(&old).await.unwrap();
        store.insert_activation(&recent).await.unwrap();

        let since = store
            .load_activations_since(now - time::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].uuid, recent.uuid);
    }

    #[tokio::test]
    async fn connect_creates_file_backed_database_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garden.sqlite3");
        let url = format!("sqlite://{}", path.display());

        let store = Store::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        let client = Client {
            uuid: Uuid::new_v4(),
            name: "greenhouse-1".into(),
        };
        store.insert_client(&client).await.unwrap();
        drop(store);

        let reopened = Store::connect(&url).await.unwrap();
        let clients = reopened.load_all_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].uuid, client.uuid);
    }
}
