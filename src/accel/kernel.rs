//! Kernel descriptors and templates.
//!
//! A kernel is never assembled from source text. A [`KernelTemplate`] names
//! a vector body, its record width and a typed parameter schema; a
//! [`KernelDescriptor`] selects a template and supplies parameter values.
//! Descriptors are validated on `build()` and again against the template
//! schema when an accelerator compiles them.

use std::collections::BTreeMap;

use crate::error::{KernelError, KernelResult};

// ── Parameters ────────────────────────────────────────────────────────

/// Type of a kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamKind {
    Float,
    Unsigned,
}

/// A typed kernel parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamValue {
    Float(f32),
    Unsigned(u32),
}

impl ParamValue {
    pub fn kind(self) -> ParamKind {
        match self {
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Unsigned(_) => ParamKind::Unsigned,
        }
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Unsigned(v)
    }
}

/// One entry of a template's parameter schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    /// Value used when a descriptor omits the parameter. `None` makes the
    /// parameter required.
    pub default: Option<ParamValue>,
}

impl ParamSpec {
    /// A float parameter with a default.
    pub const fn float(name: &'static str, default: f32) -> Self {
        ParamSpec {
            name,
            kind: ParamKind::Float,
            default: Some(ParamValue::Float(default)),
        }
    }

    /// An unsigned parameter with a default.
    pub const fn unsigned(name: &'static str, default: u32) -> Self {
        ParamSpec {
            name,
            kind: ParamKind::Unsigned,
            default: Some(ParamValue::Unsigned(default)),
        }
    }

    /// A parameter every descriptor must supply.
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        ParamSpec {
            name,
            kind,
            default: None,
        }
    }
}

/// Resolved parameter values handed to a kernel body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelParams {
    values: BTreeMap<String, ParamValue>,
}

impl KernelParams {
    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.values.get(name).copied()
    }

    /// Float parameter `name`, or `0.0` if absent.
    pub fn float(&self, name: &str) -> f32 {
        match self.get(name) {
            Some(ParamValue::Float(v)) => v,
            Some(ParamValue::Unsigned(v)) => v as f32,
            None => 0.0,
        }
    }

    /// Unsigned parameter `name`, or `0` if absent.
    pub fn unsigned(&self, name: &str) -> u32 {
        match self.get(name) {
            Some(ParamValue::Unsigned(v)) => v,
            Some(ParamValue::Float(v)) => v as u32,
            None => 0,
        }
    }
}

// ── Templates ─────────────────────────────────────────────────────────

/// Per-record kernel body.
pub type KernelFn = fn(record: &mut [f32], params: &KernelParams);

/// A named, parameterized vector kernel.
#[derive(Debug, Clone)]
pub struct KernelTemplate {
    name: &'static str,
    record_width: usize,
    params: Vec<ParamSpec>,
    body: KernelFn,
}

impl KernelTemplate {
    pub fn new(name: &'static str, record_width: usize, body: KernelFn) -> Self {
        KernelTemplate {
            name,
            record_width,
            params: Vec::new(),
            body,
        }
    }

    /// Add a parameter to the schema.
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn record_width(&self) -> usize {
        self.record_width
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Apply the body to one record.
    #[inline]
    pub fn apply(&self, record: &mut [f32], params: &KernelParams) {
        (self.body)(record, params)
    }

    /// Check `descriptor` against this template and resolve defaults.
    pub fn resolve(&self, descriptor: &KernelDescriptor) -> KernelResult<KernelParams> {
        if descriptor.record_width() != self.record_width {
            return Err(KernelError::InvalidKernel(format!(
                "template {} has record width {}, descriptor asks for {}",
                self.name,
                self.record_width,
                descriptor.record_width()
            )));
        }
        for (name, value) in descriptor.params() {
            let spec = self
                .params
                .iter()
                .find(|spec| spec.name == name)
                .ok_or_else(|| {
                    KernelError::InvalidKernel(format!(
                        "template {} has no parameter {name}",
                        self.name
                    ))
                })?;
            if spec.kind != value.kind() {
                return Err(KernelError::InvalidKernel(format!(
                    "parameter {name} of {} is {:?}, got {:?}",
                    self.name,
                    spec.kind,
                    value.kind()
                )));
            }
        }
        let mut values = BTreeMap::new();
        for spec in &self.params {
            let value = descriptor
                .params()
                .get(spec.name)
                .copied()
                .or(spec.default)
                .ok_or_else(|| {
                    KernelError::InvalidKernel(format!(
                        "missing required parameter {} of {}",
                        spec.name, self.name
                    ))
                })?;
            values.insert(spec.name.to_string(), value);
        }
        Ok(KernelParams { values })
    }
}

// ── Descriptor ────────────────────────────────────────────────────────

/// A validated request for a kernel: template name, record width and
/// parameter values.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelDescriptor {
    template: String,
    record_width: usize,
    params: BTreeMap<String, ParamValue>,
}

impl KernelDescriptor {
    /// Start building a descriptor for `template`.
    pub fn builder(template: impl Into<String>) -> KernelDescriptorBuilder {
        KernelDescriptorBuilder {
            template: template.into(),
            record_width: None,
            params: Vec::new(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn record_width(&self) -> usize {
        self.record_width
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }
}

/// Fluent builder for [`KernelDescriptor`].
///
/// # Example
/// ```rust
/// use timewarp::accel::KernelDescriptor;
///
/// let descriptor = KernelDescriptor::builder("seir_rk4")
///     .record_width(4)
///     .param("r0", 2.5f32)
///     .param("substeps", 20u32)
///     .build()
///     .unwrap();
/// assert_eq!(descriptor.template(), "seir_rk4");
/// ```
#[derive(Debug, Clone)]
pub struct KernelDescriptorBuilder {
    template: String,
    record_width: Option<usize>,
    params: Vec<(String, ParamValue)>,
}

impl KernelDescriptorBuilder {
    /// Number of `f32` values per entity record.
    pub fn record_width(mut self, width: usize) -> Self {
        self.record_width = Some(width);
        self
    }

    /// Set a parameter value.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Validate and produce the descriptor.
    pub fn build(self) -> KernelResult<KernelDescriptor> {
        if !is_identifier(&self.template) {
            return Err(KernelError::InvalidKernel(format!(
                "template name {:?} is not an identifier",
                self.template
            )));
        }
        let record_width = match self.record_width {
            Some(width) if width > 0 => width,
            _ => {
                return Err(KernelError::InvalidKernel(
                    "record width must be set and non-zero".into(),
                ))
            }
        };
        let mut params = BTreeMap::new();
        for (name, value) in self.params {
            if !is_identifier(&name) {
                return Err(KernelError::InvalidKernel(format!(
                    "parameter name {name:?} is not an identifier"
                )));
            }
            if let ParamValue::Float(v) = value {
                if !v.is_finite() {
                    return Err(KernelError::InvalidKernel(format!(
                        "parameter {name} is not finite"
                    )));
                }
            }
            if params.insert(name.clone(), value).is_some() {
                return Err(KernelError::InvalidKernel(format!(
                    "parameter {name} set twice"
                )));
            }
        }
        Ok(KernelDescriptor {
            template: self.template,
            record_width,
            params,
        })
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ── Built-in templates ────────────────────────────────────────────────

/// `x ← scale·x + offset`, one value per record.
pub fn affine_template() -> KernelTemplate {
    KernelTemplate::new("affine", 1, affine)
        .param(ParamSpec::float("scale", 1.0))
        .param(ParamSpec::float("offset", 0.0))
}

fn affine(record: &mut [f32], params: &KernelParams) {
    let scale = params.float("scale");
    let offset = params.float("offset");
    for x in record.iter_mut() {
        *x = scale * *x + offset;
    }
}

/// One unit of time of an SEIR compartmental model, integrated with
/// classical fourth-order Runge-Kutta. Records are `[S, E, I, R]`.
pub fn seir_rk4_template() -> KernelTemplate {
    KernelTemplate::new("seir_rk4", 4, seir_rk4)
        .param(ParamSpec::float("mu", 0.011))
        .param(ParamSpec::float("sigma", 0.5))
        .param(ParamSpec::float("gamma", 0.3333))
        .param(ParamSpec::float("r0", 3.0))
        .param(ParamSpec::unsigned("substeps", 10))
}

/// Advance `[S, E, I, R]` by one unit of time.
///
/// Shared by the accelerator kernel and by inline execution so both paths
/// produce bit-identical results.
pub fn seir_rk4(record: &mut [f32], params: &KernelParams) {
    let mu = params.float("mu");
    let sigma = params.float("sigma");
    let gamma = params.float("gamma");
    let r0 = params.float("r0");
    let substeps = params.unsigned("substeps").max(1);
    let beta = r0 * ((mu + sigma) * (mu + gamma)) / sigma;
    let h = 1.0 / substeps as f32;

    let derive = |x: &[f32; 4]| -> [f32; 4] {
        let n = x[0] + x[1] + x[2] + x[3];
        let force = if n > 0.0 { beta * x[2] * x[0] / n } else { 0.0 };
        [
            mu * n - mu * x[0] - force,
            force - sigma * x[1],
            sigma * x[1] - (gamma + mu) * x[2],
            gamma * x[2] - mu * x[3],
        ]
    };
    let offset = |x: &[f32; 4], k: &[f32; 4], scale: f32| -> [f32; 4] {
        [
            x[0] + k[0] * scale,
            x[1] + k[1] * scale,
            x[2] + k[2] * scale,
            x[3] + k[3] * scale,
        ]
    };

    let mut x = [record[0], record[1], record[2], record[3]];
    for _ in 0..substeps {
        let k1 = derive(&x);
        let k2 = derive(&offset(&x, &k1, h / 2.0));
        let k3 = derive(&offset(&x, &k2, h / 2.0));
        let k4 = derive(&offset(&x, &k3, h));
        for i in 0..4 {
            x[i] += (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]) * h / 6.0;
        }
    }
    record[..4].copy_from_slice(&x);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_bad_names() {
        assert!(KernelDescriptor::builder("").record_width(1).build().is_err());
        assert!(KernelDescriptor::builder("Seir-RK4").record_width(1).build().is_err());
        assert!(KernelDescriptor::builder("ok")
            .record_width(1)
            .param("bad name", 1.0f32)
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_requires_width() {
        assert!(KernelDescriptor::builder("affine").build().is_err());
        assert!(KernelDescriptor::builder("affine").record_width(0).build().is_err());
    }

    #[test]
    fn test_builder_rejects_duplicates_and_nan() {
        let dup = KernelDescriptor::builder("affine")
            .record_width(1)
            .param("scale", 1.0f32)
            .param("scale", 2.0f32)
            .build();
        assert!(dup.is_err());
        let nan = KernelDescriptor::builder("affine")
            .record_width(1)
            .param("scale", f32::NAN)
            .build();
        assert!(nan.is_err());
    }

    #[test]
    fn test_resolve_fills_defaults() {
        let descriptor = KernelDescriptor::builder("affine")
            .record_width(1)
            .param("scale", 3.0f32)
            .build()
            .unwrap();
        let params = affine_template().resolve(&descriptor).unwrap();
        assert_eq!(params.float("scale"), 3.0);
        assert_eq!(params.float("offset"), 0.0);
    }

    #[test]
    fn test_resolve_rejects_schema_mismatch() {
        let template = seir_rk4_template();
        let wrong_width = KernelDescriptor::builder("seir_rk4").record_width(3).build().unwrap();
        assert!(template.resolve(&wrong_width).is_err());

        let unknown = KernelDescriptor::builder("seir_rk4")
            .record_width(4)
            .param("delta", 1.0f32)
            .build()
            .unwrap();
        assert!(template.resolve(&unknown).is_err());

        let wrong_type = KernelDescriptor::builder("seir_rk4")
            .record_width(4)
            .param("substeps", 1.5f32)
            .build()
            .unwrap();
        assert!(template.resolve(&wrong_type).is_err());
    }

    #[test]
    fn test_required_parameter_must_be_supplied() {
        let template = KernelTemplate::new("needs_k", 1, affine)
            .param(ParamSpec::required("k", ParamKind::Unsigned));
        let descriptor = KernelDescriptor::builder("needs_k").record_width(1).build().unwrap();
        assert!(template.resolve(&descriptor).is_err());
    }

    #[test]
    fn test_seir_conserves_population_without_births() {
        let descriptor = KernelDescriptor::builder("seir_rk4")
            .record_width(4)
            .param("mu", 0.0f32)
            .build()
            .unwrap();
        let params = seir_rk4_template().resolve(&descriptor).unwrap();
        let mut record = [990.0, 0.0, 10.0, 0.0];
        seir_rk4(&mut record, &params);
        let total: f32 = record.iter().sum();
        assert!((total - 1000.0).abs() < 1e-2);
        assert!(record[0] < 990.0);
        assert!(record[1] > 0.0);
    }
}
