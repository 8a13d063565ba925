//! `Garden`: owns every in-memory entity collection and runs the tick
//! pipeline. An explicit struct threaded through `main`/`cli`, rather than
//! a process-wide singleton with global mutable state.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{ConnectionManager, SerialWorkerHandle};
use crate::db::Store;
use crate::error::GardenError;
use crate::models::{Activation, ActivationOwner, Client, Consequence, Element, Relay, Rule, RuleLimit, Schedule, Sensor, Slave, SlaveId};
use crate::relay;
use crate::rules;

fn local_seconds_of_day(now: OffsetDateTime, utc_offset_seconds: i32) -> i32 {
    let utc_seconds = now.hour() as i32 * 3600 + now.minute() as i32 * 60 + now.second() as i32;
    (utc_seconds + utc_offset_seconds).rem_euclid(86_400)
}

pub struct Garden {
    store: Store,
    connections: ConnectionManager,
    config: Config,

    #[allow(dead_code)]
    clients: HashMap<Uuid, Client>,
    slaves: HashMap<SlaveId, Slave>,
    sensors: HashMap<Uuid, Sensor>,
    relays: HashMap<Uuid, Relay>,
    schedules: HashMap<Uuid, Schedule>,
    rules: HashMap<Uuid, Rule>,
    elements: HashMap<Uuid, Element>,
    consequences: HashMap<Uuid, Consequence>,
    rule_limits: HashMap<Uuid, RuleLimit>,
    activations: HashMap<Uuid, Activation>,
}

impl Garden {
    /// Load every entity table into memory and run startup activation
    /// cleanup: any `Activation` still open at process start belongs to no
    /// in-memory owner and is terminated with `end_time` set to its prior
    /// `last_update` rather than the current time.
    pub async fn load(store: Store, config: Config) -> Result<Self, GardenError> {
        let clients = store
            .load_all_clients()
            .await?
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        let slaves: HashMap<SlaveId, Slave> = store
            .load_all_slaves()
            .await?
            .into_iter()
            .map(|s| (s.uuid.clone(), s))
            .collect();
        let sensors = store
            .load_all_sensors()
            .await?
            .into_iter()
            .map(|s| (s.uuid, s))
            .collect();
        let relays = store
            .load_all_relays()
            .await?
            .into_iter()
            .map(|r| (r.uuid, r))
            .collect();
        let schedules = store
            .load_all_schedules()
            .await?
            .into_iter()
            .map(|s| (s.uuid, s))
            .collect();
        let rules = store
            .load_all_rules()
            .await?
            .into_iter()
            .map(|r| (r.uuid, r))
            .collect();
        let elements = store
            .load_all_elements()
            .await?
            .into_iter()
            .map(|e| (e.uuid, e))
            .collect();
        let consequences = store
            .load_all_consequences()
            .await?
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        let rule_limits = store
            .load_all_rule_limits()
            .await?
            .into_iter()
            .map(|l| (l.uuid, l))
            .collect();

        let mut activations: HashMap<Uuid, Activation> = store
            .load_all_activations()
            .await?
            .into_iter()
            .map(|a| (a.uuid, a))
            .collect();

        let orphaned: Vec<Uuid> = activations
            .values()
            .filter(|a| a.is_open())
            .map(|a| a.uuid)
            .collect();
        for uuid in orphaned {
            let activation = activations.get_mut(&uuid).unwrap();
            activation.terminate(None);
            let snapshot = activation.clone();
            if let Err(e) = store.update_activation(&snapshot).await {
                warn!(%uuid, error = %e, "failed to persist startup activation cleanup");
            }
        }

        // Mark every slave disconnected at startup; connectivity will be
        // re-established by the first tick's discovery pass.
        let mut slaves = slaves;
        for slave in slaves.values_mut() {
            slave.connected = false;
        }

        let worker = SerialWorkerHandle::spawn(
            config.baud,
            std::time::Duration::from_millis(config.read_timeout_ms),
        );
        let connections = ConnectionManager::new(worker, &config.serial_glob)?;

        Ok(Garden {
            store,
            connections,
            config,
            clients,
            slaves,
            sensors,
            relays,
            schedules,
            rules,
            elements,
            consequences,
            rule_limits,
            activations,
        })
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    pub fn tick_interval_ms(&self) -> u64 {
        self.config.tick_interval_ms
    }

    /// One full pass of the control pipeline, in order:
    /// `reset_online_flag → make_connections → update_slaves →
    /// read_active_sensors → check_schedule → calculate_forced_relays →
    /// check_rules → contact_relays`.
    pub async fn tick(&mut self) -> Result<(), GardenError> {
        let now_wall = OffsetDateTime::now_utc();
        let now_mono = Instant::now();

        self.connections.make_connections().await?;
        self.update_slaves(now_wall).await;

        let readings = self.read_active_sensors().await;
        let schedule_applies = self.check_schedule(now_wall);

        self.calculate_forced_relays(now_wall).await;

        let signals = self.check_rules(&readings, &schedule_applies, now_wall).await;

        self.contact_relays(&signals, now_mono).await;

        Ok(())
    }

    async fn update_slaves(&mut self, now_wall: OffsetDateTime) {
        let online: HashSet<SlaveId> = self.connections.online_slave_uuids().into_iter().collect();

        for uuid in &online {
            match self.slaves.get_mut(uuid) {
                Some(slave) => {
                    slave.connected = true;
                    slave.last_seen = now_wall;
                    if let Err(e) = self
                        .store
                        .update_slave_connected(uuid, true, now_wall)
                        .await
                    {
                        warn!(%uuid, error = %e, "failed to persist slave connected flag");
                    }
                }
                None => {
                    let slave = Slave {
                        uuid: uuid.clone(),
                        nickname: uuid.to_string(),
                        connected: true,
                        last_seen: now_wall,
                    };
                    if let Err(e) = self.store.insert_slave(&slave).await {
                        warn!(%uuid, error = %e, "failed to persist newly discovered slave");
                    }
                    info!(%uuid, "discovered new slave");
                    self.slaves.insert(uuid.clone(), slave);
                }
            }
        }

        let stale: Vec<SlaveId> = self
            .slaves
            .iter()
            .filter(|(uuid, slave)| slave.connected && !online.contains(uuid))
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in stale {
            if let Some(slave) = self.slaves.get_mut(&uuid) {
                slave.connected = false;
            }
            if let Err(e) = self
                .store
                .update_slave_connected(&uuid, false, now_wall)
                .await
            {
                warn!(%uuid, error = %e, "failed to persist slave disconnected flag");
            }
        }
    }

    async fn read_active_sensors(&self) -> HashMap<Uuid, f64> {
        let mut readings = HashMap::new();
        for sensor in self.sensors.values() {
            if !sensor.active {
                continue;
            }
            let Some(slave) = self.slaves.get(&sensor.slave_uuid) else {
                continue;
            };
            if !slave.connected {
                continue;
            }
            if let Some(value) = self
                .connections
                .read_sensor(
                    &sensor.slave_uuid,
                    sensor.pin_type(),
                    sensor.pin,
                    &sensor.driver,
                    &sensor.measurement_type,
                )
                .await
            {
                readings.insert(sensor.uuid, value);
            }
        }
        readings
    }

    fn check_schedule(&self, now_wall: OffsetDateTime) -> HashMap<Uuid, bool> {
        let sec_of_day = local_seconds_of_day(now_wall, self.config.utc_offset_seconds);
        self.schedules
            .values()
            .map(|s| (s.uuid, s.applies_at(sec_of_day)))
            .collect()
    }

    async fn calculate_forced_relays(&mut self, now_wall: OffsetDateTime) {
        let relay_ids: Vec<Uuid> = self.relays.keys().copied().collect();
        for relay_id in relay_ids {
            let slave_connected = {
                let relay = &self.relays[&relay_id];
                self.slaves
                    .get(&relay.slave_uuid)
                    .map(|s| s.connected)
                    .unwrap_or(false)
            };

            let outcome = {
                let relay = self.relays.get_mut(&relay_id).unwrap();
                relay::apply_manual_force(relay, slave_connected)
            };

            if outcome.open_activation {
                self.open_relay_activation(relay_id, now_wall).await;
            } else if outcome.close_activation {
                self.close_relay_activation(relay_id, now_wall).await;
            }
        }
    }

    async fn open_relay_activation(&mut self, relay_id: Uuid, now_wall: OffsetDateTime) {
        let activation = Activation {
            uuid: Uuid::new_v4(),
            owner: ActivationOwner::Relay(relay_id),
            start_time: now_wall,
            end_time: None,
            last_update: now_wall,
        };
        match self.store.insert_activation(&activation).await {
            Ok(()) => {
                if let Some(relay) = self.relays.get_mut(&relay_id) {
                    relay.current_activation = Some(activation.uuid);
                }
                self.activations.insert(activation.uuid, activation);
            }
            Err(e) => warn!(%relay_id, error = %e, "failed to open relay activation, retrying next tick"),
        }
    }

    async fn close_relay_activation(&mut self, relay_id: Uuid, now_wall: OffsetDateTime) {
        let Some(activation_id) = self.relays.get(&relay_id).and_then(|r| r.current_activation)
        else {
            return;
        };
        let Some(mut activation) = self.activations.get(&activation_id).cloned() else {
            return;
        };
        activation.terminate(Some(now_wall));
        match self.store.update_activation(&activation).await {
            Ok(()) => {
                self.activations.insert(activation.uuid, activation);
                if let Some(relay) = self.relays.get_mut(&relay_id) {
                    relay.current_activation = None;
                }
            }
            Err(e) => warn!(%relay_id, error = %e, "failed to close relay activation, retrying next tick"),
        }
    }

    /// Per-rule hysteresis, combine, limit enforcement, activation
    /// open/close, and consequence signal collection.
    async fn check_rules(
        &mut self,
        readings: &HashMap<Uuid, f64>,
        schedule_applies: &HashMap<Uuid, bool>,
        now_wall: OffsetDateTime,
    ) -> HashMap<Uuid, bool> {
        let mut signals: HashMap<Uuid, bool> = HashMap::new();
        let rule_ids: Vec<Uuid> = self.rules.keys().copied().collect();

        for rule_id in rule_ids {
            let schedule_uuid = self.rules[&rule_id].schedule_uuid;
            let schedule_active = schedule_applies.get(&schedule_uuid).copied().unwrap_or(false);

            if !schedule_active {
                if self.rules[&rule_id].current_activation.is_some() {
                    self.close_rule_activation(rule_id, now_wall).await;
                }
                continue;
            }

            let elements: Vec<Element> = self
                .elements
                .values()
                .filter(|e| e.rule_uuid == rule_id)
                .cloned()
                .collect();

            for element in &elements {
                let reading = readings.get(&element.sensor_uuid).copied();
                let rule = self.rules.get_mut(&rule_id).unwrap();
                let prev = rule
                    .element_tracks
                    .get(&element.uuid)
                    .copied()
                    .unwrap_or_default();
                let new_track = rules::transition(prev, reading, element);
                rule.element_tracks.insert(element.uuid, new_track);
            }

            let tracks: Vec<_> = elements
                .iter()
                .map(|e| self.rules[&rule_id].element_tracks[&e.uuid])
                .collect();

            let mut passed = match self.rules[&rule_id].logic() {
                Some(logic) => rules::combine(&tracks, logic),
                None => false,
            };

            if passed {
                let limits: Vec<RuleLimit> = self
                    .rule_limits
                    .values()
                    .filter(|l| l.rule_uuid == rule_id)
                    .cloned()
                    .collect();
                let rule_activations: Vec<Activation> = self
                    .activations
                    .values()
                    .filter(|a| a.owner == ActivationOwner::Rule(rule_id))
                    .cloned()
                    .collect();
                for limit in &limits {
                    if limit.exceeded(rule_activations.iter(), now_wall) {
                        passed = false;
                        break;
                    }
                }
            }

            if passed && self.rules[&rule_id].current_activation.is_none() {
                self.open_rule_activation(rule_id, now_wall).await;
            } else if !passed && self.rules[&rule_id].current_activation.is_some() {
                self.close_rule_activation(rule_id, now_wall).await;
            }

            if passed {
                let consequences: Vec<Consequence> = self
                    .consequences
                    .values()
                    .filter(|c| c.rule_uuid == rule_id)
                    .cloned()
                    .collect();
                for consequence in consequences {
                    if let Some(relay) = self.relays.get(&consequence.relay_uuid) {
                        if relay.active {
                            signals.insert(consequence.relay_uuid, true);
                        }
                    }
                }
            }
        }

        signals
    }

    async fn open_rule_activation(&mut self, rule_id: Uuid, now_wall: OffsetDateTime) {
        let activation = Activation {
            uuid: Uuid::new_v4(),
            owner: ActivationOwner::Rule(rule_id),
            start_time: now_wall,
            end_time: None,
            last_update: now_wall,
        };
        match self.store.insert_activation(&activation).await {
            Ok(()) => {
                if let Some(rule) = self.rules.get_mut(&rule_id) {
                    rule.current_activation = Some(activation.uuid);
                }
                self.activations.insert(activation.uuid, activation);
            }
            Err(e) => warn!(%rule_id, error = %e, "failed to open rule activation, retrying next tick"),
        }
    }

    async fn close_rule_activation(&mut self, rule_id: Uuid, now_wall: OffsetDateTime) {
        let Some(activation_id) = self.rules.get(&rule_id).and_then(|r| r.current_activation)
        else {
            return;
        };
        let Some(mut activation) = self.activations.get(&activation_id).cloned() else {
            return;
        };
        activation.terminate(Some(now_wall));
        match self.store.update_activation(&activation).await {
            Ok(()) => {
                self.activations.insert(activation.uuid, activation);
                if let Some(rule) = self.rules.get_mut(&rule_id) {
                    rule.current_activation = None;
                }
            }
            Err(e) => warn!(%rule_id, error = %e, "failed to close rule activation, retrying next tick"),
        }
    }

    async fn contact_relays(&mut self, signals: &HashMap<Uuid, bool>, now_mono: Instant) {
        let relay_ids: Vec<Uuid> = self.relays.keys().copied().collect();
        for relay_id in relay_ids {
            let desired = signals.get(&relay_id).copied();
            let safety_seconds = self.config.safety_seconds;

            let transmit = {
                let relay = self.relays.get_mut(&relay_id).unwrap();
                relay::contact(relay, desired, now_mono, safety_seconds)
            };

            let Some(state) = transmit else { continue };

            let (slave_uuid, pin) = {
                let relay = &self.relays[&relay_id];
                (relay.slave_uuid.clone(), relay.pin)
            };

            if let Some(confirmed) = self.connections.set_relay(&slave_uuid, pin, state).await {
                if let Some(relay) = self.relays.get_mut(&relay_id) {
                    relay.current_state = confirmed;
                }
            }
        }
    }

    /// Shutdown closeout sequence: terminate all serial sessions, mark
    /// every currently-connected slave disconnected, and close every open
    /// Relay/Rule activation.
    pub async fn shutdown(&mut self) -> Result<(), GardenError> {
        self.connections.terminate_all().await;
        self.connections.shutdown_worker();

        let now_wall = OffsetDateTime::now_utc();

        let connected: Vec<SlaveId> = self
            .slaves
            .iter()
            .filter(|(_, s)| s.connected)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in connected {
            if let Some(slave) = self.slaves.get_mut(&uuid) {
                slave.connected = false;
            }
            if let Err(e) = self
                .store
                .update_slave_connected(&uuid, false, now_wall)
                .await
            {
                warn!(%uuid, error = %e, "failed to persist slave disconnected flag during shutdown");
            }
        }

        let relay_ids: Vec<Uuid> = self.relays.keys().copied().collect();
        for relay_id in relay_ids {
            if self.relays[&relay_id].current_activation.is_some() {
                self.close_relay_activation(relay_id, now_wall).await;
            }
        }

        let rule_ids: Vec<Uuid> = self.rules.keys().copied().collect();
        for rule_id in rule_ids {
            if self.rules[&rule_id].current_activation.is_some() {
                self.close_rule_activation(rule_id, now_wall).await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_seconds_of_day_wraps_negative_offsets() {
        let now = time::macros::datetime!(2026-01-01 0:30:00 UTC);
        // UTC-1 offset should roll back across midnight.
        assert_eq!(local_seconds_of_day(now, -3600), 86_400 - 1800);
    }

    #[test]
    fn local_seconds_of_day_wraps_positive_offsets_past_midnight() {
        let now = time::macros::datetime!(2026-01-01 23:30:00 UTC);
        assert_eq!(local_seconds_of_day(now, 3600), 1800);
    }
}
