//! Declarative shapes for every value exchanged on an endpoint.
//!
//! A [`Shape`] describes what a JSON value must look like; [`validate`]
//! walks a value against it and reports the first failing field path.
//! Packet unions are closed sets of object shapes discriminated by their
//! `type` field.

use std::fmt;

use serde_json::Value;

pub const DISCRIMINATOR: &str = "type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToClient,
    ToServer,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToClient => f.write_str("to-client"),
            Direction::ToServer => f.write_str("to-server"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Any,
    /// No value at all; only `null` is accepted on the wire.
    Void,
    String,
    Number,
    /// Whole number in `0..=max`; fractional spellings such as `3.0` are rejected.
    Unsigned(u64),
    Boolean,
    Literal(&'static str),
    Enum(&'static [&'static str]),
    Array(Box<Shape>),
    /// String-keyed map with uniform values.
    Record(Box<Shape>),
    Object(Vec<Field>),
    Nullable(Box<Shape>),
    Union(PacketUnion),
}

impl Shape {
    pub const U32: Shape = Shape::Unsigned(u32::MAX as u64);
    pub const U64: Shape = Shape::Unsigned(u64::MAX);

    pub fn array(item: Shape) -> Self {
        Shape::Array(Box::new(item))
    }

    pub fn record(value: Shape) -> Self {
        Shape::Record(Box::new(value))
    }

    pub fn nullable(inner: Shape) -> Self {
        Shape::Nullable(Box::new(inner))
    }

    pub fn object(fields: Vec<Field>) -> Self {
        Shape::Object(fields)
    }

    fn describe(&self) -> String {
        match self {
            Shape::Any => "any value".to_string(),
            Shape::Void => "no value".to_string(),
            Shape::String => "string".to_string(),
            Shape::Number => "number".to_string(),
            Shape::Unsigned(max) if *max == u64::MAX => "non-negative integer".to_string(),
            Shape::Unsigned(max) => format!("integer in 0..={max}"),
            Shape::Boolean => "boolean".to_string(),
            Shape::Literal(lit) => format!("literal \"{lit}\""),
            Shape::Enum(options) => format!("one of {}", options.join(", ")),
            Shape::Array(_) => "array".to_string(),
            Shape::Record(_) | Shape::Object(_) | Shape::Union(_) => "object".to_string(),
            Shape::Nullable(inner) => format!("{} or null", inner.describe()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub shape: Shape,
    pub optional: bool,
}

impl Field {
    pub fn required(name: &'static str, shape: Shape) -> Self {
        Self {
            name,
            shape,
            optional: false,
        }
    }

    pub fn optional(name: &'static str, shape: Shape) -> Self {
        Self {
            name,
            shape,
            optional: true,
        }
    }
}

/// One member of a discriminated union, identified by its `type` literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub tag: &'static str,
    pub fields: Vec<Field>,
}

impl Variant {
    pub fn new(tag: &'static str, fields: Vec<Field>) -> Self {
        Self { tag, fields }
    }

    pub fn unit(tag: &'static str) -> Self {
        Self::new(tag, Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PacketUnion {
    variants: Vec<Variant>,
}

impl PacketUnion {
    pub fn new(variants: Vec<Variant>) -> Self {
        Self { variants }
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.variants.iter().map(|v| v.tag)
    }

    pub fn variant(&self, tag: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.tag == tag)
    }

    pub fn validate(&self, value: &Value) -> Result<(), FieldError> {
        validate_union(self, value, &mut Path::root())
    }
}

/// First failure found while walking a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct Path {
    segments: Vec<Segment>,
}

#[derive(Debug)]
enum Segment {
    Key(String),
    Index(usize),
}

impl Path {
    fn root() -> Self {
        Self::default()
    }

    fn render(&self) -> String {
        if self.segments.is_empty() {
            return "<root>".to_string();
        }
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Key(key) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(key);
                }
                Segment::Index(index) => {
                    out.push_str(&format!("[{index}]"));
                }
            }
        }
        out
    }

    fn fail(&self, message: impl Into<String>) -> FieldError {
        FieldError::new(self.render(), message)
    }

    fn with<T>(&mut self, segment: Segment, f: impl FnOnce(&mut Self) -> T) -> T {
        self.segments.push(segment);
        let out = f(self);
        self.segments.pop();
        out
    }
}

pub fn validate(shape: &Shape, value: &Value) -> Result<(), FieldError> {
    validate_at(shape, value, &mut Path::root())
}

fn validate_at(shape: &Shape, value: &Value, path: &mut Path) -> Result<(), FieldError> {
    match shape {
        Shape::Any => Ok(()),
        Shape::Void => value.is_null().then_some(()).ok_or_else(|| mismatch(shape, value, path)),
        Shape::String => value.is_string().then_some(()).ok_or_else(|| mismatch(shape, value, path)),
        Shape::Number => value.is_number().then_some(()).ok_or_else(|| mismatch(shape, value, path)),
        Shape::Boolean => value.is_boolean().then_some(()).ok_or_else(|| mismatch(shape, value, path)),
        Shape::Unsigned(max) => match value.as_u64() {
            Some(n) if n <= *max => Ok(()),
            _ => Err(mismatch(shape, value, path)),
        },
        Shape::Literal(lit) => match value.as_str() {
            Some(s) if s == *lit => Ok(()),
            _ => Err(mismatch(shape, value, path)),
        },
        Shape::Enum(options) => match value.as_str() {
            Some(s) if options.contains(&s) => Ok(()),
            _ => Err(mismatch(shape, value, path)),
        },
        Shape::Nullable(inner) => {
            if value.is_null() {
                Ok(())
            } else {
                validate_at(inner, value, path)
            }
        }
        Shape::Array(item) => {
            let items = value.as_array().ok_or_else(|| mismatch(shape, value, path))?;
            for (index, element) in items.iter().enumerate() {
                path.with(Segment::Index(index), |path| validate_at(item, element, path))?;
            }
            Ok(())
        }
        Shape::Record(item) => {
            let map = value.as_object().ok_or_else(|| mismatch(shape, value, path))?;
            for (key, element) in map {
                path.with(Segment::Key(key.clone()), |path| {
                    validate_at(item, element, path)
                })?;
            }
            Ok(())
        }
        Shape::Object(fields) => validate_fields(fields, value, path),
        Shape::Union(union) => validate_union(union, value, path),
    }
}

fn validate_fields(fields: &[Field], value: &Value, path: &mut Path) -> Result<(), FieldError> {
    let map = value
        .as_object()
        .ok_or_else(|| path.fail(format!("expected object, found {}", kind_of(value))))?;

    for field in fields {
        path.with(Segment::Key(field.name.to_string()), |path| {
            match map.get(field.name) {
                None if field.optional => Ok(()),
                None => Err(path.fail("missing required field")),
                Some(inner) => validate_at(&field.shape, inner, path),
            }
        })?;
    }
    Ok(())
}

fn validate_union(union: &PacketUnion, value: &Value, path: &mut Path) -> Result<(), FieldError> {
    let map = value
        .as_object()
        .ok_or_else(|| path.fail(format!("expected object, found {}", kind_of(value))))?;

    let tag = path.with(Segment::Key(DISCRIMINATOR.to_string()), |path| {
        match map.get(DISCRIMINATOR) {
            None => Err(path.fail("missing discriminator")),
            Some(Value::String(tag)) => Ok(tag.clone()),
            Some(other) => Err(path.fail(format!("expected string, found {}", kind_of(other)))),
        }
    })?;

    let variant = union.variant(&tag).ok_or_else(|| {
        let expected: Vec<&str> = union.tags().collect();
        path.with(Segment::Key(DISCRIMINATOR.to_string()), |path| {
            path.fail(format!(
                "unknown type \"{tag}\", expected one of {}",
                expected.join(", ")
            ))
        })
    })?;

    validate_fields(&variant.fields, value, path)
}

fn mismatch(shape: &Shape, value: &Value, path: &Path) -> FieldError {
    path.fail(format!(
        "expected {}, found {}",
        shape.describe(),
        kind_of(value)
    ))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
