//! Decoded-value schemas
//!
//! A schema lists the fields one decoded row carries: numeric type, optional
//! units and, for waveform fields, the fixed array length and sample period.
//! Each decoder keeps a template and patches the waveform length per channel
//! from the object info; the result is never mutated afterwards.

use serde::Serialize;

/// Storage type of one field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int16,
}

/// Sample spacing of a waveform field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePeriod {
    pub value: f64,
    pub units: String,
}

/// One field of a decoded row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub dtype: NumericType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Fixed array length; only waveform fields have one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_period: Option<SamplePeriod>,
}

impl FieldSpec {
    pub fn scalar(name: &str, dtype: NumericType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            units: None,
            length: None,
            sample_period: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    /// Waveform field in ADC units
    pub fn waveform(name: &str, dtype: NumericType, length: usize, period_ns: f64) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            units: Some("adc".to_string()),
            length: Some(length),
            sample_period: Some(SamplePeriod {
                value: period_ns,
                units: "ns".to_string(),
            }),
        }
    }

    pub fn is_waveform(&self) -> bool {
        self.length.is_some()
    }
}

/// Ordered field layout for one channel
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct DecodedSchema {
    fields: Vec<FieldSpec>,
}

impl DecodedSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Length of the `waveform` field, if the schema has one
    pub fn waveform_length(&self) -> Option<usize> {
        self.field(WAVEFORM).and_then(|f| f.length)
    }

    /// Copy of this schema with the `waveform` field narrowed to `length`
    pub fn with_waveform_length(&self, length: usize) -> Self {
        let mut schema = self.clone();
        if let Some(field) = schema.fields.iter_mut().find(|f| f.name == WAVEFORM) {
            field.length = Some(length);
        }
        schema
    }
}

/// Name of the waveform field in every digitizer schema
pub const WAVEFORM: &str = "waveform";

/// Fields shared by the three digitizer templates, in ORCA column order
pub(crate) fn digitizer_header(timestamp: NumericType, energy_first: bool) -> Vec<FieldSpec> {
    let mut fields = vec![
        FieldSpec::scalar("packet_id", NumericType::Uint32),
        FieldSpec::scalar("ievt", NumericType::Uint32),
        FieldSpec::scalar("energy", NumericType::Uint32).with_units("adc"),
    ];
    if energy_first {
        fields.push(FieldSpec::scalar("energy_first", NumericType::Uint32));
    }
    fields.extend([
        FieldSpec::scalar("timestamp", timestamp).with_units("clock_ticks"),
        FieldSpec::scalar("crate", NumericType::Uint8),
        FieldSpec::scalar("card", NumericType::Uint8),
        FieldSpec::scalar("channel", NumericType::Uint8),
    ]);
    fields
}
