use crate::prelude::*;
use crate::{err_ctx, Result};
use serde::{Deserialize, Serialize};
use std::any::type_name;

pub(crate) fn from_json_string<'a, T: Deserialize<'a>>(input: &'a str) -> Result<T> {
    serde_json::from_str(input).map_err(err_ctx!(DeserializeError::Json {
        input: input.to_owned(),
        target_ty: type_name::<T>()
    }))
}

pub(crate) fn to_json_string(data: &(impl Serialize + ?Sized)) -> String {
    serialize(data, serde_json::to_string)
}

pub(crate) fn to_json_string_pretty(data: &(impl Serialize + ?Sized)) -> String {
    serialize(data, serde_json::to_string_pretty)
}

fn serialize<T, E>(data: &T, imp: fn(&T) -> Result<String, E>) -> String
where
    T: Serialize + ?Sized,
    E: std::error::Error,
{
    imp(data).unwrap_or_else(|err| {
        let data_type = type_name::<T>();
        panic!(
            "Can't serialize data of type {data_type}: {}",
            err.display_chain()
        )
    })
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DeserializeError {
    #[error("Failed to parse JSON as `{target_ty}`, input surrounded by backticks:\n```\n{input:?}\n```")]
    Json {
        target_ty: &'static str,
        input: String,
        source: serde_json::Error,
    },
}
