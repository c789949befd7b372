/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

//! Placeholder expansion for script templates.  A template is parsed once
//! into literal text and "{{NAME}}" references; evaluation fails if any
//! reference has no value, so nothing is run with a hole in it.

use crate::error::ProvisionError;
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Chunk {
    Literal(String),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    chunks: Vec<Chunk>,
}

fn valid_name(n: &str) -> bool {
    !n.is_empty()
        && n.starts_with(|c: char| c.is_ascii_uppercase())
        && n
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

impl Expansion {
    pub fn parse(template: &str) -> Result<Expansion> {
        let mut chunks = Vec::new();
        let mut rest = template;
        let mut line = 1;

        while let Some(open) = rest.find("{{") {
            let (lit, after) = rest.split_at(open);
            line += lit.matches('\n').count();
            if !lit.is_empty() {
                chunks.push(Chunk::Literal(lit.to_string()));
            }

            let after = &after[2..];
            let close = after.find("}}").ok_or_else(|| {
                ProvisionError::config(format!("line {}: unterminated \"{{{{\"", line))
            })?;
            let name = after[..close].trim();
            if !valid_name(name) {
                return Err(ProvisionError::config(format!(
                    "line {}: bad placeholder \"{{{{{}}}}}\"",
                    line,
                    &after[..close]
                )));
            }
            chunks.push(Chunk::Variable(name.to_string()));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            chunks.push(Chunk::Literal(rest.to_string()));
        }

        Ok(Expansion { chunks })
    }

    pub fn variables(&self) -> BTreeSet<&str> {
        self.chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::Variable(v) => Some(v.as_str()),
                Chunk::Literal(_) => None,
            })
            .collect()
    }

    /**
     * Substitute every placeholder.  All missing names are reported together.
     */
    pub fn evaluate(&self, values: &HashMap<String, String>) -> Result<String> {
        let missing: Vec<&str> = self
            .variables()
            .into_iter()
            .filter(|v| !values.contains_key(*v))
            .collect();
        if !missing.is_empty() {
            return Err(ProvisionError::config(format!(
                "no value for template placeholder(s): {}",
                missing.join(", ")
            )));
        }

        let mut out = String::new();
        for c in self.chunks.iter() {
            match c {
                Chunk::Literal(l) => out += l,
                Chunk::Variable(v) => out += &values[v],
            }
        }
        Ok(out)
    }
}

/**
 * Flatten a parameter struct into placeholder values.  Field names become
 * placeholder names as written by the struct's serde attributes; lists are
 * joined with spaces and absent values become empty strings.
 */
pub fn values_of<T: Serialize>(params: &T) -> Result<HashMap<String, String>> {
    let v = serde_json::to_value(params)?;
    let serde_json::Value::Object(map) = v else {
        return Err(ProvisionError::config("template parameters must be a struct"));
    };

    fn scalar(v: &serde_json::Value) -> Result<String> {
        Ok(match v {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => String::new(),
            serde_json::Value::Array(a) => a
                .iter()
                .map(scalar)
                .collect::<Result<Vec<_>>>()?
                .join(" "),
            serde_json::Value::Object(_) => {
                return Err(ProvisionError::config(
                    "nested objects cannot be template parameters",
                ))
            }
        })
    }

    map.iter()
        .map(|(k, v)| -> Result<(String, String)> { Ok((k.clone(), scalar(v)?)) })
        .collect()
}
