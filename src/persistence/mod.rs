//! Persistence
//!
//! Writes retained publications and durable subscriptions to flat record
//! streams, read back at startup. Saves go through a two-generation
//! backup swap: the current file is renamed to the 1-suffix name and the
//! old backup to the 2-suffix name before the new file is written; on a
//! write error the backups are rolled back and the broker keeps running.
//!
//! Record formats (all integers big-endian):
//!   retained:      payload_len u32, payload, qos u32, topic_len u32, topic
//!   subscription:  client_id_len u32, client_id, no_local u32, qos u32,
//!                  topic_len u32, topic

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::QoS;
use crate::session::{Session, SessionStore, Variant};
use crate::topic::{Priority, SubscriptionEngine};

/// Retained-publication file and its two backup generations
const RETAINED_FILES: [&str; 3] = ["broker.rms", "broker.1ms", "broker.2ms"];
/// Durable-subscription file and its two backup generations
const SUBSCRIPTION_FILES: [&str; 3] = ["broker.sub", "broker.1ub", "broker.2ub"];

/// Persistence error
#[derive(Debug)]
pub enum PersistenceError {
    Io(io::Error),
    /// A record was cut short or carried an impossible length
    Corrupt(&'static str),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Io(e) => write!(f, "IO error: {}", e),
            PersistenceError::Corrupt(msg) => write!(f, "corrupt persistence file: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<io::Error> for PersistenceError {
    fn from(e: io::Error) -> Self {
        PersistenceError::Io(e)
    }
}

/// A retained record as exchanged with the subscription engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedRecord {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

/// A durable-subscription record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub client_id: String,
    pub no_local: bool,
    pub qos: QoS,
    pub topic: String,
}

/// Persistence manager for one data directory
pub struct PersistenceManager {
    dir: PathBuf,
    /// 0 = save only at shutdown and on SIGHUP
    autosave_interval: Duration,
    last_save: Mutex<Instant>,
}

impl PersistenceManager {
    pub fn new(dir: impl Into<PathBuf>, autosave_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            autosave_interval,
            last_save: Mutex::new(Instant::now()),
        }
    }

    /// Is an autosave due at this housekeeping boundary?
    pub fn autosave_due(&self, dirty: bool) -> bool {
        !self.autosave_interval.is_zero()
            && dirty
            && self.last_save.lock().elapsed() >= self.autosave_interval
    }

    /// Restore retained publications and durable subscriptions into the
    /// engine; durable subscribers get a disconnected persistent session
    /// so queued deliveries have somewhere to go.
    pub fn load(
        &self,
        subscriptions: &SubscriptionEngine,
        sessions: &SessionStore,
    ) -> Result<(usize, usize), PersistenceError> {
        let retained = self.load_retained()?;
        let retained_count = retained.len();
        for record in retained {
            subscriptions.set_retained(&record.topic, record.qos, record.payload);
        }

        let subs = self.load_subscriptions()?;
        let sub_count = subs.len();
        for record in subs {
            let client_id: Arc<str> = Arc::from(record.client_id.as_str());
            subscriptions.subscribe(
                &client_id,
                &record.topic,
                record.qos,
                record.no_local,
                true,
                Priority::Normal,
            );
            if sessions.get(&client_id).is_none() {
                let mut session = Session::new(client_id.clone(), Variant::Mqtt);
                session.clean_session = false;
                sessions.insert_disconnected(
                    client_id,
                    Arc::new(parking_lot::RwLock::new(session)),
                );
            }
        }

        // A fresh load is the baseline; nothing to save yet
        subscriptions.clear_dirty();
        Ok((retained_count, sub_count))
    }

    /// Save both streams through the backup swap.
    pub fn save(&self, subscriptions: &SubscriptionEngine) -> Result<(), PersistenceError> {
        let retained: Vec<RetainedRecord> = subscriptions
            .retained_snapshot()
            .into_iter()
            .map(|r| RetainedRecord {
                topic: r.topic.to_string(),
                qos: r.qos,
                payload: r.payload,
            })
            .collect();
        let subs: Vec<SubscriptionRecord> = subscriptions
            .durable_snapshot()
            .into_iter()
            .map(|s| SubscriptionRecord {
                client_id: s.client_id.to_string(),
                no_local: s.no_local,
                qos: s.qos,
                topic: s.filter.to_string(),
            })
            .collect();

        self.save_stream(&RETAINED_FILES, |file| {
            for record in &retained {
                write_retained(file, record)?;
            }
            Ok(())
        })?;
        self.save_stream(&SUBSCRIPTION_FILES, |file| {
            for record in &subs {
                write_subscription(file, record)?;
            }
            Ok(())
        })?;

        *self.last_save.lock() = Instant::now();
        info!(
            "Persistence saved: {} retained, {} subscriptions",
            retained.len(),
            subs.len()
        );
        Ok(())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn load_retained(&self) -> Result<Vec<RetainedRecord>, PersistenceError> {
        let path = self.path(RETAINED_FILES[0]);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        read_retained_stream(&data)
    }

    fn load_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, PersistenceError> {
        let path = self.path(SUBSCRIPTION_FILES[0]);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        read_subscription_stream(&data)
    }

    /// Rotate the backups, write the new file, roll back on error.
    fn save_stream<F>(&self, names: &[&str; 3], write: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut File) -> Result<(), PersistenceError>,
    {
        let primary = self.path(names[0]);
        let gen1 = self.path(names[1]);
        let gen2 = self.path(names[2]);

        fs::create_dir_all(&self.dir)?;

        // Rotate: current -> .1, old .1 -> .2
        if primary.exists() {
            if gen1.exists() {
                fs::rename(&gen1, &gen2)?;
            }
            fs::rename(&primary, &gen1)?;
        }

        let result = File::create(&primary)
            .map_err(PersistenceError::from)
            .and_then(|mut file| {
                write(&mut file)?;
                file.sync_all()?;
                Ok(())
            });

        if let Err(e) = result {
            warn!("Persistence write failed, rolling back: {}", e);
            let _ = fs::remove_file(&primary);
            if gen1.exists() {
                let _ = fs::rename(&gen1, &primary);
            }
            if gen2.exists() {
                let _ = fs::rename(&gen2, &gen1);
            }
            return Err(e);
        }

        debug!("Wrote {}", primary.display());
        Ok(())
    }
}

fn write_u32(file: &mut File, value: u32) -> Result<(), PersistenceError> {
    file.write_all(&value.to_be_bytes())?;
    Ok(())
}

fn write_retained(file: &mut File, record: &RetainedRecord) -> Result<(), PersistenceError> {
    write_u32(file, record.payload.len() as u32)?;
    file.write_all(&record.payload)?;
    write_u32(file, record.qos as u32)?;
    write_u32(file, record.topic.len() as u32)?;
    file.write_all(record.topic.as_bytes())?;
    Ok(())
}

fn write_subscription(file: &mut File, record: &SubscriptionRecord) -> Result<(), PersistenceError> {
    write_u32(file, record.client_id.len() as u32)?;
    file.write_all(record.client_id.as_bytes())?;
    write_u32(file, record.no_local as u32)?;
    write_u32(file, record.qos as u32)?;
    write_u32(file, record.topic.len() as u32)?;
    file.write_all(record.topic.as_bytes())?;
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn u32(&mut self) -> Result<u32, PersistenceError> {
        if self.pos + 4 > self.data.len() {
            return Err(PersistenceError::Corrupt("truncated integer"));
        }
        let v = u32::from_be_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], PersistenceError> {
        if self.pos + len > self.data.len() {
            return Err(PersistenceError::Corrupt("truncated field"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn string(&mut self, len: usize) -> Result<String, PersistenceError> {
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| PersistenceError::Corrupt("invalid UTF-8 in record"))
    }
}

fn read_retained_stream(data: &[u8]) -> Result<Vec<RetainedRecord>, PersistenceError> {
    let mut cursor = Cursor::new(data);
    let mut records = Vec::new();
    while !cursor.done() {
        let payload_len = cursor.u32()? as usize;
        let payload = Bytes::copy_from_slice(cursor.bytes(payload_len)?);
        let qos = QoS::from_u8(cursor.u32()? as u8)
            .ok_or(PersistenceError::Corrupt("bad qos in retained record"))?;
        let topic_len = cursor.u32()? as usize;
        let topic = cursor.string(topic_len)?;
        records.push(RetainedRecord {
            topic,
            qos,
            payload,
        });
    }
    Ok(records)
}

fn read_subscription_stream(data: &[u8]) -> Result<Vec<SubscriptionRecord>, PersistenceError> {
    let mut cursor = Cursor::new(data);
    let mut records = Vec::new();
    while !cursor.done() {
        let client_id_len = cursor.u32()? as usize;
        let client_id = cursor.string(client_id_len)?;
        let no_local = cursor.u32()? != 0;
        let qos = QoS::from_u8(cursor.u32()? as u8)
            .ok_or(PersistenceError::Corrupt("bad qos in subscription record"))?;
        let topic_len = cursor.u32()? as usize;
        let topic = cursor.string(topic_len)?;
        records.push(SubscriptionRecord {
            client_id,
            no_local,
            qos,
            topic,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager(dir: &Path) -> PersistenceManager {
        PersistenceManager::new(dir, Duration::from_secs(0))
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SubscriptionEngine::new();
        let sessions = SessionStore::new();

        engine.set_retained("sensor/1", QoS::AtLeastOnce, Bytes::from_static(b"42"));
        engine.set_retained("sensor/2", QoS::AtMostOnce, Bytes::from_static(b"abc"));
        let client: Arc<str> = Arc::from("c1");
        engine.subscribe(&client, "sensor/#", QoS::AtLeastOnce, false, true, Priority::Normal);

        manager(dir.path()).save(&engine).unwrap();

        let engine2 = SubscriptionEngine::new();
        let sessions2 = SessionStore::new();
        let (retained, subs) = manager(dir.path()).load(&engine2, &sessions2).unwrap();
        assert_eq!(retained, 2);
        assert_eq!(subs, 1);

        let restored = engine2.get_retained("sensor/+");
        assert_eq!(restored.len(), 2);
        assert_eq!(engine2.durable_snapshot().len(), 1);
        // The durable subscriber exists as a disconnected session
        assert_eq!(sessions2.disconnected_count(), 1);
        let _ = sessions;
    }

    #[test]
    fn test_backup_generations_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SubscriptionEngine::new();
        engine.set_retained("a", QoS::AtMostOnce, Bytes::from_static(b"1"));

        let mgr = manager(dir.path());
        mgr.save(&engine).unwrap();
        mgr.save(&engine).unwrap();
        mgr.save(&engine).unwrap();

        assert!(dir.path().join("broker.rms").exists());
        assert!(dir.path().join("broker.1ms").exists());
        assert!(dir.path().join("broker.2ms").exists());
    }

    #[test]
    fn test_empty_load() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SubscriptionEngine::new();
        let sessions = SessionStore::new();
        let (retained, subs) = manager(dir.path()).load(&engine, &sessions).unwrap();
        assert_eq!(retained, 0);
        assert_eq!(subs, 0);
    }

    #[test]
    fn test_corrupt_stream_detected() {
        assert!(read_retained_stream(&[0, 0]).is_err());
        assert!(read_retained_stream(&[0, 0, 0, 10, b'x']).is_err());
        assert!(read_subscription_stream(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_record_layout() {
        // payload_len, payload, qos, topic_len, topic
        let records = read_retained_stream(&[
            0, 0, 0, 2, b'4', b'2', // payload "42"
            0, 0, 0, 1, // qos 1
            0, 0, 0, 3, b'a', b'/', b'b', // topic "a/b"
        ])
        .unwrap();
        assert_eq!(
            records,
            vec![RetainedRecord {
                topic: "a/b".to_string(),
                qos: QoS::AtLeastOnce,
                payload: Bytes::from_static(b"42"),
            }]
        );
    }
}
