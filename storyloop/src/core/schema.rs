//! Embedded JSON Schemas for the persisted task set and the generated plan.

use std::sync::LazyLock;

use jsonschema::Validator;
use serde_json::Value;

pub const TASK_SET_SCHEMA: &str = include_str!("../../schemas/task_set.schema.json");
pub const GENERATED_PLAN_SCHEMA: &str = include_str!("../../schemas/generated_plan.schema.json");

static TASK_SET_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(TASK_SET_SCHEMA));
static GENERATED_PLAN_VALIDATOR: LazyLock<Validator> =
    LazyLock::new(|| compile(GENERATED_PLAN_SCHEMA));

fn compile(raw: &str) -> Validator {
    let schema: Value = serde_json::from_str(raw).expect("embedded schema should be valid JSON");
    jsonschema::validator_for(&schema).expect("embedded schema should compile")
}

/// Schema violations of a persisted task set document, empty when valid.
pub fn task_set_errors(instance: &Value) -> Vec<String> {
    collect_errors(&TASK_SET_VALIDATOR, instance)
}

/// Schema violations of a generated plan payload, empty when valid.
pub fn generated_plan_errors(instance: &Value) -> Vec<String> {
    collect_errors(&GENERATED_PLAN_VALIDATOR, instance)
}

fn collect_errors(validator: &Validator, instance: &Value) -> Vec<String> {
    validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect()
}
