//! Lazily loaded, locally mutable view of one remote lead.
//!
//! # Design
//! A `Lead` starts empty. The first read of a field it does not hold pulls the
//! whole record once; after that, reads are served from memory. Writes only
//! touch memory and mark the field dirty. `save()` pushes the dirty fields and
//! clears the dirty set only when Marketo accepted them, so a failed save can
//! simply be retried.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::client::Client;
use crate::error::Result;
use crate::http::{Transport, UreqTransport};
use crate::types::{LeadFields, LeadId};

pub struct Lead<'c, T: Transport = UreqTransport> {
    client: &'c Client<T>,
    id: LeadId,
    values: LeadFields,
    fetched: bool,
    dirty: BTreeSet<String>,
}

impl<'c, T: Transport> Lead<'c, T> {
    /// Binds a proxy to lead `id`. No request is made.
    pub fn new(client: &'c Client<T>, id: LeadId) -> Self {
        Self {
            client,
            id,
            values: LeadFields::new(),
            fetched: false,
            dirty: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> LeadId {
        self.id
    }

    /// `true` once the remote record has been loaded.
    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Fields written locally since the last successful save, in name order.
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Returns the value of `field`, loading the record first if the field is
    /// not held locally and the record has not been loaded yet. `Ok(None)`
    /// means Marketo did not return that field.
    ///
    /// # Errors
    /// `MarketoError::NotFound` if the lead does not exist; any error from
    /// [`Client::get_lead`].
    pub fn get(&mut self, field: &str) -> Result<Option<&Value>> {
        if !self.fetched && !self.values.contains_key(field) {
            self.fetch()?;
        }
        Ok(self.values.get(field))
    }

    /// Like [`Lead::get`], deserializing the value into `V`. A JSON `null`
    /// is returned as `None`.
    ///
    /// # Errors
    /// As [`Lead::get`], plus `Deserialization` if the value has another type.
    pub fn get_as<V: DeserializeOwned>(&mut self, field: &str) -> Result<Option<V>> {
        match self.get(field)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    /// Stores `value` locally and marks `field` dirty. Never touches the network.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.values.insert(field.to_string(), value.into());
        self.dirty.insert(field.to_string());
    }

    /// Reloads the record from Marketo. Dirty values stay as written.
    ///
    /// # Errors
    /// Any error from [`Client::get_lead`].
    pub fn refresh(&mut self) -> Result<()> {
        self.fetch()
    }

    /// Sends the dirty fields to Marketo. A clean lead returns immediately.
    ///
    /// # Errors
    /// `NotFound`, `Validation` or `Api` as reported by Marketo. On error the
    /// dirty set is left intact.
    pub fn save(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let changes: LeadFields = self
            .dirty
            .iter()
            .filter_map(|name| {
                self.values
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();

        self.client.update_lead(self.id, &changes)?;
        debug!(lead_id = self.id, fields = changes.len(), "lead saved");
        self.dirty.clear();
        Ok(())
    }

    fn fetch(&mut self) -> Result<()> {
        let mut remote = self.client.get_lead(self.id)?;
        for name in &self.dirty {
            if let Some(local) = self.values.remove(name) {
                remote.insert(name.clone(), local);
            }
        }
        self.values = remote;
        self.fetched = true;
        Ok(())
    }
}

impl<T: Transport> std::fmt::Debug for Lead<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lead")
            .field("id", &self.id)
            .field("fetched", &self.fetched)
            .field("values", &self.values)
            .field("dirty", &self.dirty)
            .finish()
    }
}
