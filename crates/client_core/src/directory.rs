use std::sync::Arc;

use serde_json::{Map, Value};
use shared::{
    domain::{DeviceId, DeviceRecord, DeviceSummary},
    paths::{devices_root, DevicePaths},
    protocol::StoreWrite,
};
use storage::{KvStore, StoreError};
use tracing::{info, warn};

/// Devices written when the directory is found empty.
pub const DEFAULT_DEVICES: [(&str, &str); 3] = [
    ("rover_01", "Rover Alpha"),
    ("rover_02", "Rover Beta"),
    ("rover_03", "Rover Gamma"),
];

pub const UNNAMED_DEVICE: &str = "Unnamed Device";

#[derive(Clone)]
pub struct DeviceDirectory {
    store: Arc<dyn KvStore>,
}

impl DeviceDirectory {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Lists every device sorted by id, seeding the defaults first when the
    /// directory is empty.
    pub async fn list_devices(&self) -> Result<Vec<DeviceSummary>, StoreError> {
        if let Some(devices) = self.read_devices().await? {
            return Ok(summarize(devices));
        }

        self.seed_defaults().await?;
        Ok(self.read_devices().await?.map(summarize).unwrap_or_default())
    }

    /// Writes each default device that has no record yet. Returns how many
    /// were written.
    pub async fn seed_defaults(&self) -> Result<usize, StoreError> {
        let mut seeded = 0;
        for (raw_id, name) in DEFAULT_DEVICES {
            let device_id = DeviceId::parse(raw_id)?;
            let root = DevicePaths::new(&device_id).root().clone();
            if self.store.get(&root).await?.is_some() {
                continue;
            }
            let record = serde_json::to_value(DeviceRecord::available(name)).map_err(|error| {
                StoreError::Malformed {
                    path: root.to_string(),
                    reason: error.to_string(),
                }
            })?;
            self.store.set(&root, StoreWrite::Set(record)).await?;
            seeded += 1;
        }
        if seeded > 0 {
            info!(seeded, "directory: seeded default devices");
        }
        Ok(seeded)
    }

    pub async fn device_record(&self, device_id: &DeviceId) -> Result<Option<DeviceRecord>, StoreError> {
        let root = DevicePaths::new(device_id).root().clone();
        let Some(value) = self.store.get(&root).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|error| StoreError::Malformed {
                path: root.to_string(),
                reason: error.to_string(),
            })
    }

    async fn read_devices(&self) -> Result<Option<Map<String, Value>>, StoreError> {
        match self.store.get(&devices_root()).await? {
            Some(Value::Object(devices)) if !devices.is_empty() => Ok(Some(devices)),
            Some(Value::Object(_)) | None => Ok(None),
            Some(other) => Err(StoreError::Malformed {
                path: devices_root().to_string(),
                reason: format!("expected an object of devices, found {other}"),
            }),
        }
    }
}

fn summarize(devices: Map<String, Value>) -> Vec<DeviceSummary> {
    let mut summaries: Vec<DeviceSummary> = devices
        .into_iter()
        .filter_map(|(raw_id, record)| {
            let id = match DeviceId::parse(&raw_id) {
                Ok(id) => id,
                Err(error) => {
                    warn!(device_id = %raw_id, %error, "directory: skipping invalid device id");
                    return None;
                }
            };
            let display_name = record
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .unwrap_or(UNNAMED_DEVICE)
                .to_string();
            Some(DeviceSummary { id, display_name })
        })
        .collect();
    summaries.sort_by(|left, right| left.id.as_str().cmp(right.id.as_str()));
    summaries
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use shared::paths::StorePath;
    use storage::MemoryStore;

    use super::*;

    fn directory() -> (Arc<MemoryStore>, DeviceDirectory) {
        let store = Arc::new(MemoryStore::new());
        let directory = DeviceDirectory::new(store.clone());
        (store, directory)
    }

    #[tokio::test]
    async fn empty_directory_is_seeded_with_defaults() {
        let (store, directory) = directory();

        let devices = directory.list_devices().await.expect("list");
        let labels: Vec<String> = devices.iter().map(ToString::to_string).collect();
        assert_eq!(
            labels,
            vec![
                "rover_01 (Rover Alpha)",
                "rover_02 (Rover Beta)",
                "rover_03 (Rover Gamma)",
            ]
        );

        let status = store.read(&StorePath::parse("devices/rover_02/status").expect("path"));
        assert_eq!(status, Some(json!("available")));
    }

    #[tokio::test]
    async fn existing_devices_are_listed_without_seeding() {
        let (store, directory) = directory();
        store
            .set(
                &StorePath::parse("devices/zeta").expect("path"),
                StoreWrite::Set(json!({ "name": "Zeta" })),
            )
            .await
            .expect("write");
        store
            .set(
                &StorePath::parse("devices/alpha/status").expect("path"),
                StoreWrite::text("busy"),
            )
            .await
            .expect("write");

        let devices = directory.list_devices().await.expect("list");
        let labels: Vec<String> = devices.iter().map(ToString::to_string).collect();
        assert_eq!(labels, vec!["alpha (Unnamed Device)", "zeta (Zeta)"]);
        assert!(directory
            .device_record(&DeviceId::parse("rover_01").expect("id"))
            .await
            .expect("read")
            .is_none());
    }

    #[tokio::test]
    async fn seeding_keeps_existing_records() {
        let (store, directory) = directory();
        store
            .set(
                &StorePath::parse("devices/rover_01/name").expect("path"),
                StoreWrite::text("Custom"),
            )
            .await
            .expect("write");

        assert_eq!(directory.seed_defaults().await.expect("seed"), 2);
        let record = directory
            .device_record(&DeviceId::parse("rover_01").expect("id"))
            .await
            .expect("read")
            .expect("record");
        assert_eq!(record.name, "Custom");
    }
}
