//! Sideband lineage: emissions, value metadata, and boundary tags.
//!
//! A value travelling a pipeline is wrapped in an [`Emission`] envelope that
//! carries its stamp and lineage next to it without serialising either into
//! the value. When a plain value must cross a boundary that transports only
//! `T` — a projection into an inner stream, a one-shot auxiliary — the
//! [`Tagged`] wrapper carries the lineage across and is unwrapped on the far
//! side.

use crate::id::ValueId;
use crate::stamp::EmissionStamp;
use serde::{Deserialize, Serialize};

/// How an operator produced its output from its input(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaKind {
    /// One input, one output.
    Transform,
    /// Many inputs folded into one output.
    Collapse,
    /// One input fanned out into many outputs.
    Expand,
}

/// Lineage of one emission: which value it is, which operator shaped it last,
/// and which inputs fed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueMeta {
    /// Identity of the value this emission carries.
    pub value_id: ValueId,
    /// Index of the operator that produced this emission, if any.
    pub operator_index: Option<usize>,
    /// Name of the operator that produced this emission, if any.
    pub operator_name: Option<String>,
    /// How the producing operator related inputs to this output.
    pub kind: MetaKind,
    /// Input value ids, populated for collapse and expand emissions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_value_ids: Vec<ValueId>,
}

impl ValueMeta {
    /// Lineage for a freshly produced source value.
    pub fn source(value_id: ValueId) -> Self {
        Self {
            value_id,
            operator_index: None,
            operator_name: None,
            kind: MetaKind::Transform,
            input_value_ids: Vec::new(),
        }
    }

    /// Lineage for a one-to-one transform of an existing value.
    pub fn transformed(value_id: ValueId, operator_index: usize, operator_name: &str) -> Self {
        Self {
            value_id,
            operator_index: Some(operator_index),
            operator_name: Some(operator_name.to_owned()),
            kind: MetaKind::Transform,
            input_value_ids: Vec::new(),
        }
    }

    /// Lineage for a fan-in output carrying all contributing inputs.
    pub fn collapsed(
        value_id: ValueId,
        operator_index: usize,
        operator_name: &str,
        input_value_ids: Vec<ValueId>,
    ) -> Self {
        Self {
            value_id,
            operator_index: Some(operator_index),
            operator_name: Some(operator_name.to_owned()),
            kind: MetaKind::Collapse,
            input_value_ids,
        }
    }

    /// Lineage for a fan-out child derived from `base`.
    pub fn expanded(
        value_id: ValueId,
        operator_index: usize,
        operator_name: &str,
        base: ValueId,
    ) -> Self {
        Self {
            value_id,
            operator_index: Some(operator_index),
            operator_name: Some(operator_name.to_owned()),
            kind: MetaKind::Expand,
            input_value_ids: vec![base],
        }
    }
}

/// One value travelling a pipeline with its sideband stamp and lineage.
#[derive(Debug, Clone)]
pub struct Emission<T> {
    /// The payload.
    pub value: T,
    /// When the source produced this value, on the process-wide clock.
    pub stamp: EmissionStamp,
    /// Lineage, when the producer attached any.
    pub meta: Option<ValueMeta>,
}

impl<T> Emission<T> {
    /// A bare emission stamped now, with no lineage.
    pub fn stamped(value: T) -> Self {
        Self {
            value,
            stamp: EmissionStamp::next(),
            meta: None,
        }
    }

    /// A source emission stamped now, with a fresh value id.
    pub fn traced(value: T) -> Self {
        Self {
            value,
            stamp: EmissionStamp::next(),
            meta: Some(ValueMeta::source(ValueId::next())),
        }
    }

    /// The value id of this emission's lineage, if present.
    pub fn value_id(&self) -> Option<ValueId> {
        self.meta.as_ref().map(|m| m.value_id)
    }

    /// Rebuild the envelope around a new payload, keeping stamp and lineage.
    pub fn with_value<U>(self, value: U) -> Emission<U> {
        Emission {
            value,
            stamp: self.stamp,
            meta: self.meta,
        }
    }
}

/// A value carrying its lineage across a boundary that transports only `T`.
#[derive(Debug, Clone)]
pub struct Tagged<T> {
    /// The wrapped value.
    pub value: T,
    /// The lineage riding along.
    pub tag: ValueMeta,
}

impl<T> Tagged<T> {
    /// Attach lineage to a value.
    pub fn new(value: T, tag: ValueMeta) -> Self {
        Self { value, tag }
    }

    /// Unwrap, discarding the tag.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Re-enter a pipeline: a fresh stamp, the carried lineage.
    pub fn into_emission(self) -> Emission<T> {
        Emission {
            value: self.value,
            stamp: EmissionStamp::next(),
            meta: Some(self.tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traced_emissions_get_fresh_ids_and_increasing_stamps() {
        let a = Emission::traced(1);
        let b = Emission::traced(2);
        assert!(a.stamp < b.stamp);
        assert_ne!(a.value_id(), b.value_id());
    }

    #[test]
    fn with_value_keeps_stamp_and_meta() {
        let e = Emission::traced(3);
        let stamp = e.stamp;
        let id = e.value_id();
        let out = e.with_value("three");
        assert_eq!(out.stamp, stamp);
        assert_eq!(out.value_id(), id);
    }
}
