// src/masking.rs
//! Personal-data masking applied to response values before they leave the process.
//!
//! Rules map a field name to a [`Mask`]. [`MaskingRules::apply`] walks a
//! `serde_json::Value` and rewrites every string field whose name has a rule,
//! at any depth.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{RateLimiterError, Result};

const MASK: &str = "****";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskingType {
    /// `홍길동` → `홍*동`
    Name,
    /// `010-1234-5678` → `010-****-5678`
    PhoneNumber,
    /// `user@example.com` → `use*@example.com`
    Email,
}

impl MaskingType {
    pub fn mask(self, value: &str) -> String {
        match self {
            MaskingType::Name => mask_name(value),
            MaskingType::PhoneNumber => mask_phone_number(value),
            MaskingType::Email => mask_email(value),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Mask {
    Type(MaskingType),
    /// Every match is replaced by `****`
    Pattern(Regex),
}

impl Mask {
    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Mask::Pattern)
            .map_err(|e| RateLimiterError::Config(format!("invalid mask pattern '{}': {}", pattern, e)))
    }

    pub fn apply(&self, value: &str) -> String {
        match self {
            Mask::Type(kind) => kind.mask(value),
            Mask::Pattern(regex) => regex.replace_all(value, MASK).into_owned(),
        }
    }
}

impl From<MaskingType> for Mask {
    fn from(kind: MaskingType) -> Self {
        Mask::Type(kind)
    }
}

/// Field name → mask
#[derive(Debug, Clone, Default)]
pub struct MaskingRules {
    fields: HashMap<String, Mask>,
}

impl MaskingRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, mask: impl Into<Mask>) -> Self {
        self.fields.insert(name.into(), mask.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Masks matching string fields in place. Non-string values are left alone.
    pub fn apply(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (name, field) in map.iter_mut() {
                    match (self.fields.get(name), field) {
                        (Some(mask), Value::String(text)) => *text = mask.apply(text),
                        (_, nested) => self.apply(nested),
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|item| self.apply(item)),
            _ => {}
        }
    }

    /// Same as [`apply`](Self::apply) unless masking is switched off for this call
    pub fn apply_unless(&self, disabled: bool, value: &mut Value) {
        if !disabled {
            self.apply(value);
        }
    }

    /// Serializes `data` and masks the result
    pub fn masked<T: Serialize>(&self, data: &T) -> Result<Value> {
        let mut value = serde_json::to_value(data)?;
        self.apply(&mut value);
        Ok(value)
    }
}

fn mask_name(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 2 {
        return value.to_string();
    }

    let mut masked = String::with_capacity(value.len());
    masked.push(chars[0]);
    masked.extend(std::iter::repeat('*').take(chars.len() - 2));
    masked.push(chars[chars.len() - 1]);
    masked
}

fn phone_number_regex() -> &'static Regex {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    PHONE.get_or_init(|| {
        Regex::new(r"(\d{2,3})-?(\d{3,4})-?(\d{4})$").unwrap_or_else(|e| panic!("bad phone regex: {}", e))
    })
}

fn mask_phone_number(value: &str) -> String {
    let Some(caps) = phone_number_regex().captures(value) else {
        return value.to_string();
    };
    let Some(middle) = caps.get(2) else {
        return value.to_string();
    };

    let mut masked = String::with_capacity(value.len());
    masked.push_str(&value[..middle.start()]);
    masked.push_str(MASK);
    masked.push_str(&value[middle.end()..]);
    masked
}

fn mask_email(value: &str) -> String {
    let Some(at) = value.find('@') else {
        return value.to_string();
    };
    let (local, domain) = value.split_at(at);

    local
        .chars()
        .enumerate()
        .map(|(i, c)| if i < 3 { c } else { '*' })
        .chain(domain.chars())
        .collect()
}
