//! Resource model.
//!
//! Scalars are fixed-point (thousandths) so that repeated add/subtract cycles
//! never accumulate floating point drift. A resource carries a stack of
//! reservations, the last entry being the innermost (most refined) one.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::operation::Operation;

// =============================================================================
// Errors
// =============================================================================

/// Errors from resource arithmetic and format conversion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Legacy `role` / `reservation` fields could not be folded into the
    /// reservation stack.
    #[error("invalid legacy resource format: {0}")]
    LegacyFormat(String),

    /// An operation consumed resources that are not present.
    #[error("{needed} is not contained in {available}")]
    Insufficient { needed: String, available: String },

    /// Operation-specific failure.
    #[error("{0}")]
    Invalid(String),
}

// =============================================================================
// Scalar
// =============================================================================

/// Fixed-point scalar quantity with three decimal places.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scalar(i64);

impl Scalar {
    pub const ZERO: Scalar = Scalar(0);

    /// Builds a scalar from thousandths.
    pub const fn from_milli(milli: i64) -> Self {
        Self(milli)
    }

    /// Builds a scalar from a float, rounding to the nearest thousandth.
    pub fn from_f64(value: f64) -> Self {
        Self((value * 1000.0).round() as i64)
    }

    pub const fn milli(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl Add for Scalar {
    type Output = Scalar;

    fn add(self, rhs: Scalar) -> Scalar {
        Scalar(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Scalar {
    type Output = Scalar;

    fn sub(self, rhs: Scalar) -> Scalar {
        Scalar(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}", self.as_f64())
        }
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        if !value.is_finite() {
            return Err(serde::de::Error::custom("scalar must be finite"));
        }
        Ok(Scalar::from_f64(value))
    }
}

// =============================================================================
// Reservations and disks
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationType {
    Static,
    Dynamic,
}

/// One layer of the reservation stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(rename = "type")]
    pub kind: ReservationType,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
}

impl Reservation {
    pub fn dynamic(role: impl Into<String>, principal: Option<&str>) -> Self {
        Self {
            kind: ReservationType::Dynamic,
            role: role.into(),
            principal: principal.map(str::to_string),
        }
    }

    pub fn statically(role: impl Into<String>) -> Self {
        Self {
            kind: ReservationType::Static,
            role: role.into(),
            principal: None,
        }
    }
}

/// Pre-refinement reservation metadata, only valid next to a legacy `role`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegacyReservation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Persistence {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockVolume {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_flags: Vec<String>,
}

/// How a volume is exposed to tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountVolume>,
    #[serde(default)]
    pub access_mode: AccessMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<Persistence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<VolumeCapability>,
}

// =============================================================================
// Resource
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub scalar: Scalar,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reservations: Vec<Reservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<LegacyReservation>,
}

impl Resource {
    /// Unreserved scalar resource.
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            scalar: Scalar::from_f64(value),
            reservations: Vec::new(),
            disk: None,
            allocation_role: None,
            role: None,
            reservation: None,
        }
    }

    /// Pushes a reservation layer.
    pub fn with_reservation(mut self, reservation: Reservation) -> Self {
        self.reservations.push(reservation);
        self
    }

    /// Turns the resource into a persistent volume.
    pub fn with_persistence(mut self, id: impl Into<String>, principal: Option<&str>) -> Self {
        let disk = self.disk.get_or_insert_with(DiskInfo::default);
        disk.persistence = Some(Persistence {
            id: id.into(),
            principal: principal.map(str::to_string),
        });
        self
    }

    pub fn with_scalar(mut self, scalar: Scalar) -> Self {
        self.scalar = scalar;
        self
    }

    pub fn is_reserved(&self) -> bool {
        !self.reservations.is_empty()
    }

    pub fn is_dynamically_reserved(&self) -> bool {
        self.reservations
            .last()
            .is_some_and(|r| r.kind == ReservationType::Dynamic)
    }

    /// Role of the innermost reservation, `*` if unreserved.
    pub fn reservation_role(&self) -> &str {
        self.reservations.last().map_or("*", |r| r.role.as_str())
    }

    pub fn persistence(&self) -> Option<&Persistence> {
        self.disk.as_ref().and_then(|d| d.persistence.as_ref())
    }

    pub fn is_persistent_volume(&self) -> bool {
        self.persistence().is_some()
    }

    /// The same resource with the innermost reservation removed.
    pub fn pop_reservation(&self) -> Self {
        let mut popped = self.clone();
        popped.reservations.pop();
        popped
    }

    /// The same resource without any disk metadata.
    pub fn strip_disk_info(&self) -> Self {
        let mut stripped = self.clone();
        stripped.disk = None;
        stripped
    }

    /// Folds the legacy `role` / `reservation` pair into the reservation stack.
    pub fn upgrade(&mut self) -> Result<(), ResourceError> {
        match (self.role.take(), self.reservation.take()) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(ResourceError::LegacyFormat(format!(
                "resource '{}' has a 'reservation' but no 'role'",
                self.name
            ))),
            (Some(role), reservation) if role == "*" => {
                if reservation.is_some() {
                    return Err(ResourceError::LegacyFormat(format!(
                        "unreserved resource '{}' cannot carry a 'reservation'",
                        self.name
                    )));
                }
                Ok(())
            }
            (Some(role), reservation) => {
                if !self.reservations.is_empty() {
                    return Err(ResourceError::LegacyFormat(format!(
                        "resource '{}' sets both 'role' and 'reservations'",
                        self.name
                    )));
                }
                let layer = match reservation {
                    Some(legacy) => Reservation {
                        kind: ReservationType::Dynamic,
                        role,
                        principal: legacy.principal,
                    },
                    None => Reservation::statically(role),
                };
                self.reservations.push(layer);
                Ok(())
            }
        }
    }

    /// Everything but the quantity matches.
    fn same_kind(&self, other: &Resource) -> bool {
        self.name == other.name
            && self.reservations == other.reservations
            && self.disk == other.disk
            && self.allocation_role == other.allocation_role
            && self.role == other.role
            && self.reservation == other.reservation
    }

    /// Persistent volumes are indivisible, so they never merge.
    fn mergeable(&self, other: &Resource) -> bool {
        self.same_kind(other) && !self.is_persistent_volume()
    }

    fn covers(&self, other: &Resource) -> bool {
        if !self.same_kind(other) {
            return false;
        }
        if self.is_persistent_volume() {
            self.scalar == other.scalar
        } else {
            self.scalar >= other.scalar
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.reservations.is_empty() {
            write!(f, "(*)")?;
        } else {
            let roles: Vec<&str> = self.reservations.iter().map(|r| r.role.as_str()).collect();
            write!(f, "({})", roles.join(","))?;
        }
        if let Some(persistence) = self.persistence() {
            write!(f, "[{}]", persistence.id)?;
        }
        write!(f, ":{}", self.scalar)
    }
}

// =============================================================================
// Resources
// =============================================================================

/// A normalized bag of resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Resource>", into = "Vec<Resource>")]
pub struct Resources(Vec<Resource>);

impl Resources {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.0.iter()
    }

    pub fn add_resource(&mut self, resource: &Resource) {
        if resource.scalar == Scalar::ZERO {
            return;
        }
        if let Some(existing) = self.0.iter_mut().find(|r| r.mergeable(resource)) {
            existing.scalar = existing.scalar + resource.scalar;
            if existing.scalar == Scalar::ZERO {
                self.0.retain(|r| r.scalar != Scalar::ZERO);
            }
            return;
        }
        self.0.push(resource.clone());
    }

    /// Saturating removal: never leaves a negative quantity behind.
    pub fn subtract_resource(&mut self, resource: &Resource) {
        let Some(index) = self.0.iter().position(|r| r.same_kind(resource)) else {
            return;
        };
        let existing = &mut self.0[index];
        if existing.is_persistent_volume() {
            if existing.scalar == resource.scalar {
                self.0.remove(index);
            }
            return;
        }
        if existing.scalar <= resource.scalar {
            self.0.remove(index);
        } else {
            existing.scalar = existing.scalar - resource.scalar;
        }
    }

    /// Fails on the first resource whose quantity is not positive.
    pub fn validate_quantities(&self) -> Result<(), ResourceError> {
        match self.0.iter().find(|r| !r.scalar.is_positive()) {
            Some(resource) => Err(ResourceError::Invalid(format!(
                "Resource {resource} has a non-positive quantity"
            ))),
            None => Ok(()),
        }
    }

    pub fn contains_resource(&self, resource: &Resource) -> bool {
        self.0.iter().any(|r| r.covers(resource))
    }

    pub fn contains(&self, other: &Resources) -> bool {
        let mut remaining = self.clone();
        for resource in &other.0 {
            if !remaining.contains_resource(resource) {
                return false;
            }
            remaining.subtract_resource(resource);
        }
        true
    }

    /// True if any resource in `other` is of a kind held here.
    pub fn overlaps(&self, other: &Resources) -> bool {
        other
            .0
            .iter()
            .any(|o| self.0.iter().any(|r| r.same_kind(o)))
    }

    /// Total quantity across all resources with the given name.
    pub fn scalar(&self, name: &str) -> Scalar {
        self.0
            .iter()
            .filter(|r| r.name == name)
            .fold(Scalar::ZERO, |acc, r| acc + r.scalar)
    }

    pub fn persistent_volumes(&self) -> impl Iterator<Item = &Resource> {
        self.0.iter().filter(|r| r.is_persistent_volume())
    }

    pub fn filter(&self, predicate: impl Fn(&Resource) -> bool) -> Resources {
        self.0.iter().filter(|r| predicate(r)).cloned().collect()
    }

    pub fn pop_reservation(&self) -> Resources {
        self.0.iter().map(Resource::pop_reservation).collect()
    }

    pub fn strip_disk_infos(&self) -> Resources {
        self.0.iter().map(Resource::strip_disk_info).collect()
    }

    /// Marks every resource as allocated to `role`.
    pub fn allocate(&self, role: &str) -> Resources {
        self.0
            .iter()
            .map(|r| {
                let mut allocated = r.clone();
                allocated.allocation_role = Some(role.to_string());
                allocated
            })
            .collect()
    }

    pub fn unallocate(&self) -> Resources {
        self.0
            .iter()
            .map(|r| {
                let mut unallocated = r.clone();
                unallocated.allocation_role = None;
                unallocated
            })
            .collect()
    }

    /// Converts every resource to the reservation-stack format.
    pub fn upgrade(&mut self) -> Result<(), ResourceError> {
        let mut upgraded = Vec::with_capacity(self.0.len());
        for mut resource in self.0.drain(..) {
            resource.upgrade()?;
            upgraded.push(resource);
        }
        *self = upgraded.into_iter().collect();
        Ok(())
    }

    fn take(&mut self, needed: &Resources) -> Result<(), ResourceError> {
        if !self.contains(needed) {
            return Err(ResourceError::Insufficient {
                needed: needed.to_string(),
                available: self.to_string(),
            });
        }
        *self -= needed;
        Ok(())
    }

    /// Returns these resources as they look after `operation` is applied.
    pub fn apply(&self, operation: &Operation) -> Result<Resources, ResourceError> {
        let mut result = self.clone();
        match operation {
            Operation::Reserve { resources } => {
                result.take(&resources.pop_reservation())?;
                result += resources;
            }
            Operation::Unreserve { resources } => {
                result.take(resources)?;
                result += &resources.pop_reservation();
            }
            Operation::Create { volumes } => {
                result.take(&volumes.strip_disk_infos())?;
                result += volumes;
            }
            Operation::Destroy { volumes } => {
                result.take(volumes)?;
                result += &volumes.strip_disk_infos();
            }
            Operation::GrowVolume { volume, addition } => {
                result.take(&Resources::from(vec![volume.clone(), addition.clone()]))?;
                result.add_resource(&volume.clone().with_scalar(volume.scalar + addition.scalar));
            }
            Operation::ShrinkVolume { volume, subtract } => {
                if *subtract >= volume.scalar {
                    return Err(ResourceError::Invalid(format!(
                        "cannot shrink {volume} by {subtract}"
                    )));
                }
                result.take(&Resources::from(vec![volume.clone()]))?;
                result.add_resource(&volume.clone().with_scalar(volume.scalar - *subtract));
                result.add_resource(&volume.strip_disk_info().with_scalar(*subtract));
            }
            Operation::Launch { .. } => {}
        }
        Ok(result)
    }
}

impl PartialEq for Resources {
    fn eq(&self, other: &Self) -> bool {
        self.contains(other) && other.contains(self)
    }
}

impl Eq for Resources {}

impl From<Vec<Resource>> for Resources {
    fn from(resources: Vec<Resource>) -> Self {
        resources.into_iter().collect()
    }
}

impl From<Resources> for Vec<Resource> {
    fn from(resources: Resources) -> Self {
        resources.0
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        let mut resources = Resources::new();
        for resource in iter {
            resources.add_resource(&resource);
        }
        resources
    }
}

impl<'a> IntoIterator for &'a Resources {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, rhs: &Resources) {
        for resource in &rhs.0 {
            self.add_resource(resource);
        }
    }
}

impl SubAssign<&Resources> for Resources {
    fn sub_assign(&mut self, rhs: &Resources) {
        for resource in &rhs.0 {
            self.subtract_resource(resource);
        }
    }
}

impl Add<&Resources> for &Resources {
    type Output = Resources;

    fn add(self, rhs: &Resources) -> Resources {
        let mut sum = self.clone();
        sum += rhs;
        sum
    }
}

impl Sub<&Resources> for &Resources {
    type Output = Resources;

    fn sub(self, rhs: &Resources) -> Resources {
        let mut difference = self.clone();
        difference -= rhs;
        difference
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        for (i, resource) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{resource}")?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
