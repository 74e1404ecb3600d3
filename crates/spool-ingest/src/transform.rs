//! Per-record transformers
//!
//! A transformer maps one record to a new record. It must not mutate its input
//! or touch anything outside the value it returns, so a chunk can be replayed
//! through it any number of times.

use crate::model::Person;
use spool_common::Result;
use tracing::debug;

/// Pure mapping applied to every record of a chunk
pub trait Transformer<R>: Send + Sync {
    fn transform(&self, record: &R) -> Result<R>;
}

/// Upper-cases both name fields of a [`Person`]
#[derive(Debug, Clone, Copy, Default)]
pub struct UppercaseTransformer;

impl Transformer<Person> for UppercaseTransformer {
    fn transform(&self, person: &Person) -> Result<Person> {
        let transformed = Person::new(
            person.first_name.to_uppercase(),
            person.last_name.to_uppercase(),
        );

        debug!(from = %person, to = %transformed, "Converted person");

        Ok(transformed)
    }
}
