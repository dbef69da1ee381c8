//! In-memory object store implementing [`ObjectRegistry`].

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::clock::Timestamp;
use crate::core::config::{Config, HostDefinition, ServiceDefinition};
use crate::core::errors::{Result, VigilError};
use crate::objects::host::Host;
use crate::objects::service::Service;
use crate::objects::{Checkable, HostCheckable, HostId, ObjectRef, ObjectRegistry, ServiceId};

/// Next-check times requested by applied results, drained by the scheduler.
#[derive(Debug, Default)]
pub struct RescheduleRequests {
    pending: Mutex<Vec<(ObjectRef, Timestamp)>>,
}

impl RescheduleRequests {
    pub fn push(&self, object: ObjectRef, next_check: Timestamp) {
        self.pending.lock().push((object, next_check));
    }

    pub fn drain(&self) -> Vec<(ObjectRef, Timestamp)> {
        std::mem::take(&mut *self.pending.lock())
    }
}

#[derive(Default)]
struct StoreInner {
    hosts: BTreeMap<HostId, Arc<Host>>,
    host_names: HashMap<String, HostId>,
    services: BTreeMap<ServiceId, Arc<Service>>,
    service_names: HashMap<(HostId, String), ServiceId>,
    next_host_id: u64,
    next_service_id: u64,
}

pub struct ObjectStore {
    inner: RwLock<StoreInner>,
    reschedules: Arc<RescheduleRequests>,
    interval_length: u64,
    aggressive_host_checking: bool,
}

impl ObjectStore {
    #[must_use]
    pub fn new(interval_length: u64, aggressive_host_checking: bool) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                next_host_id: 1,
                next_service_id: 1,
                ..StoreInner::default()
            }),
            reschedules: Arc::new(RescheduleRequests::default()),
            interval_length,
            aggressive_host_checking,
        }
    }

    /// Build hosts then services from the `[objects]` section.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Self::new(config.interval_length(), config.use_aggressive_host_checking());
        for def in &config.objects.hosts {
            store.add_host(def)?;
        }
        for def in &config.objects.services {
            store.add_service(def)?;
        }
        Ok(store)
    }

    pub fn add_host(&self, def: &HostDefinition) -> Result<HostId> {
        let mut inner = self.inner.write();
        if inner.host_names.contains_key(&def.name) {
            return Err(VigilError::InvalidConfig {
                details: format!("duplicate host {:?}", def.name),
            });
        }
        let id = HostId(inner.next_host_id);
        inner.next_host_id += 1;
        let host = Host::new(
            id,
            def,
            self.interval_length,
            self.aggressive_host_checking,
            Arc::clone(&self.reschedules),
        );
        inner.hosts.insert(id, Arc::new(host));
        inner.host_names.insert(def.name.clone(), id);
        Ok(id)
    }

    pub fn add_service(&self, def: &ServiceDefinition) -> Result<ServiceId> {
        let mut inner = self.inner.write();
        let host_id = *inner
            .host_names
            .get(&def.host_name)
            .ok_or_else(|| VigilError::UnknownObject {
                details: format!(
                    "service {:?} references unknown host {:?}",
                    def.description, def.host_name
                ),
            })?;
        let key = (host_id, def.description.clone());
        if inner.service_names.contains_key(&key) {
            return Err(VigilError::InvalidConfig {
                details: format!(
                    "duplicate service {:?} on {:?}",
                    def.description, def.host_name
                ),
            });
        }
        let address = inner
            .hosts
            .get(&host_id)
            .map(|h| h.address().to_string())
            .unwrap_or_default();
        let id = ServiceId(inner.next_service_id);
        inner.next_service_id += 1;
        let service = Service::new(
            id,
            host_id,
            &address,
            def,
            self.interval_length,
            Arc::clone(&self.reschedules),
        );
        inner.services.insert(id, Arc::new(service));
        inner.service_names.insert(key, id);
        Ok(id)
    }

    /// Remove a host and its services. Pending events and results for them
    /// are dropped when they surface.
    pub fn remove_host(&self, id: HostId) -> bool {
        let mut inner = self.inner.write();
        let Some(host) = inner.hosts.remove(&id) else {
            return false;
        };
        inner.host_names.remove(&host.name());
        let doomed: Vec<ServiceId> = inner
            .service_names
            .iter()
            .filter(|((owner, _), _)| *owner == id)
            .map(|(_, sid)| *sid)
            .collect();
        for sid in doomed {
            inner.services.remove(&sid);
        }
        inner.service_names.retain(|(owner, _), _| *owner != id);
        true
    }

    pub fn remove_service(&self, id: ServiceId) -> bool {
        let mut inner = self.inner.write();
        if inner.services.remove(&id).is_none() {
            return false;
        }
        inner.service_names.retain(|_, sid| *sid != id);
        true
    }

    #[must_use]
    pub fn get_host(&self, id: HostId) -> Option<Arc<Host>> {
        self.inner.read().hosts.get(&id).cloned()
    }

    #[must_use]
    pub fn get_service(&self, id: ServiceId) -> Option<Arc<Service>> {
        self.inner.read().services.get(&id).cloned()
    }

    /// Hosts in id order.
    #[must_use]
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.inner.read().hosts.values().cloned().collect()
    }

    /// Services in id order.
    #[must_use]
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.inner.read().services.values().cloned().collect()
    }

    #[must_use]
    pub fn reschedules(&self) -> &Arc<RescheduleRequests> {
        &self.reschedules
    }

    pub fn drain_reschedules(&self) -> Vec<(ObjectRef, Timestamp)> {
        self.reschedules.drain()
    }
}

impl ObjectRegistry for ObjectStore {
    fn host(&self, id: HostId) -> Option<Arc<dyn HostCheckable>> {
        self.get_host(id).map(|h| h as Arc<dyn HostCheckable>)
    }

    fn service(&self, id: ServiceId) -> Option<Arc<dyn Checkable>> {
        self.get_service(id).map(|s| s as Arc<dyn Checkable>)
    }

    fn find_host_id(&self, name: &str) -> Option<HostId> {
        self.inner.read().host_names.get(name).copied()
    }

    fn find_service_id(&self, host: HostId, description: &str) -> Option<ServiceId> {
        self.inner
            .read()
            .service_names
            .get(&(host, description.to_string()))
            .copied()
    }
}
