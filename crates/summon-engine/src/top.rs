//! Top objects: the kinds an engine reconciles

use std::fmt::Debug;

use k8s_openapi::api::core::v1::Node;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use summon_common::crd::{
    ChildPhase, EncryptedSecret, MigrationJob, PlatformPhase, RDSSnapshot, RidecellIngress,
    SummonPlatform,
};

/// `(namespace, name)` identity of a top object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Empty for cluster-scoped kinds
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }

    /// Runtime reference for enqueueing
    pub fn to_object_ref<K: Resource<DynamicType = ()>>(&self) -> kube::runtime::reflector::ObjectRef<K> {
        let r = kube::runtime::reflector::ObjectRef::new(&self.name);
        if self.namespace.is_empty() {
            r
        } else {
            r.within(&self.namespace)
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A kind the engine can reconcile.
///
/// The engine only touches the top through this capability set: clone,
/// metadata, status read and error marking. Kinds without a status
/// (`HAS_STATUS == false`) never get a status write.
pub trait TopObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Observed state compared against the baseline to decide on a write
    type Status: Clone + PartialEq + Debug + Send + Sync;

    /// Whether status write-back applies to this kind
    const HAS_STATUS: bool = true;

    /// Current status, if any was ever set
    fn top_status(&self) -> Option<&Self::Status>;

    /// Mark the top as failed with a message
    fn set_error_status(&mut self, message: &str);
}

impl TopObject for SummonPlatform {
    type Status = summon_common::crd::SummonPlatformStatus;

    fn top_status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn set_error_status(&mut self, message: &str) {
        let status = self.status_mut();
        status.status = PlatformPhase::Error;
        status.message = message.to_string();
    }
}

macro_rules! basic_top {
    ($kind:ty, $status:ty) => {
        impl TopObject for $kind {
            type Status = $status;

            fn top_status(&self) -> Option<&Self::Status> {
                self.status.as_ref()
            }

            fn set_error_status(&mut self, message: &str) {
                let status = self.status.get_or_insert_with(Default::default);
                status.status = ChildPhase::Error;
                status.message = message.to_string();
            }
        }
    };
}

basic_top!(EncryptedSecret, summon_common::crd::EncryptedSecretStatus);
basic_top!(RidecellIngress, summon_common::crd::RidecellIngressStatus);
basic_top!(RDSSnapshot, summon_common::crd::RDSSnapshotStatus);
basic_top!(MigrationJob, summon_common::crd::MigrationJobStatus);

impl TopObject for Node {
    type Status = ();
    const HAS_STATUS: bool = false;

    fn top_status(&self) -> Option<&()> {
        None
    }

    fn set_error_status(&mut self, _message: &str) {}
}
