//! Shared JSON-RPC parameter handling.

use std::str::FromStr;

use bitcoin::{Address, Amount, address::NetworkUnchecked};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde_json::Value;

use crate::network::Network;

use super::error::{LegacyCode, RpcError, RpcResult};

/// Interprets the request's `params` field as a positional array.
///
/// Absent params mean an empty array; anything other than an array is
/// rejected.
pub(crate) fn params_array(params: &Option<Value>) -> RpcResult<&[Value]> {
    match params {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(values)) => Ok(values),
        Some(_) => Err(LegacyCode::InvalidParams
            .with_static("Invalid parameters, expected a positional array.")),
    }
}

/// A required string parameter.
pub(crate) fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> RpcResult<&'a str> {
    match params.get(index) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(invalid_type(name, "a string")),
        None => Err(missing(name)),
    }
}

/// An optional string parameter, defaulting to `default`.
pub(crate) fn opt_str_param<'a>(
    params: &'a [Value],
    index: usize,
    name: &str,
    default: &'a str,
) -> RpcResult<&'a str> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(invalid_type(name, "a string")),
    }
}

/// An optional boolean parameter, defaulting to `default`.
pub(crate) fn opt_bool_param(
    params: &[Value],
    index: usize,
    name: &str,
    default: bool,
) -> RpcResult<bool> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(invalid_type(name, "a boolean")),
    }
}

/// An optional minimum-confirmations parameter, defaulting to 1.
///
/// Negative values are rejected; zero is allowed and admits unmined
/// outputs.
pub(crate) fn opt_minconf_param(params: &[Value], index: usize) -> RpcResult<u32> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(1),
        Some(value) => {
            let n = value
                .as_i64()
                .ok_or_else(|| invalid_type("minconf", "an integer"))?;
            u32::try_from(n).map_err(|_| {
                LegacyCode::InvalidParameter
                    .with_static("Invalid parameter, minconf must not be negative.")
            })
        }
    }
}

/// An optional block-height parameter.
pub(crate) fn opt_height_param(
    params: &[Value],
    index: usize,
    name: &str,
) -> RpcResult<Option<i32>> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let n = value
                .as_i64()
                .ok_or_else(|| invalid_type(name, "an integer"))?;
            let n = i32::try_from(n).map_err(|_| {
                LegacyCode::InvalidParameter.with_message(format!(
                    "Invalid parameter, {name} is out of range."
                ))
            })?;
            if n < 0 {
                return Err(LegacyCode::InvalidParameter
                    .with_message(format!("Invalid parameter, {name} must not be negative.")));
            }
            Ok(Some(n))
        }
    }
}

/// A required unsigned integer parameter.
pub(crate) fn u64_param(params: &[Value], index: usize, name: &str) -> RpcResult<u64> {
    match params.get(index) {
        Some(value) => value
            .as_u64()
            .ok_or_else(|| invalid_type(name, "a non-negative integer")),
        None => Err(missing(name)),
    }
}

/// A required amount parameter, given in decimal BTC.
///
/// Negative amounts are rejected; zero is accepted here and left for the
/// operation to judge.
pub(crate) fn amount_param(params: &[Value], index: usize, name: &str) -> RpcResult<Amount> {
    match params.get(index) {
        Some(value) => amount_from_value(value, name),
        None => Err(missing(name)),
    }
}

/// Converts a JSON number in decimal BTC to a satoshi amount.
pub(crate) fn amount_from_value(value: &Value, name: &str) -> RpcResult<Amount> {
    let Value::Number(number) = value else {
        return Err(invalid_type(name, "a number"));
    };
    // Parse the number's own text so eight decimal places survive exactly,
    // which f64 does not guarantee. Serializers shorten small values to
    // scientific notation, which plain decimal parsing rejects.
    let text = number.to_string();
    let btc = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| invalid_type(name, "a number"))?;
    if btc.is_sign_negative() {
        return Err(LegacyCode::InvalidParameter
            .with_message(format!("Invalid parameter, {name} must not be negative.")));
    }
    let satoshis = btc
        .checked_mul(Decimal::from(Amount::ONE_BTC.to_sat()))
        .ok_or_else(|| out_of_range(name))?;
    if satoshis.fract() != Decimal::ZERO {
        return Err(LegacyCode::InvalidParameter.with_message(format!(
            "Invalid parameter, {name} has more than 8 decimal places."
        )));
    }
    satoshis
        .to_u64()
        .map(Amount::from_sat)
        .ok_or_else(|| out_of_range(name))
}

/// Parses and network-checks a payment address.
pub(crate) fn address_param(s: &str, network: Network) -> RpcResult<Address> {
    s.parse::<Address<NetworkUnchecked>>()
        .map_err(|_| {
            LegacyCode::InvalidAddressOrKey
                .with_message(format!("Invalid address: {s}"))
        })?
        .require_network(network.to_bitcoin())
        .map_err(|_| {
            LegacyCode::InvalidAddressOrKey
                .with_message(format!("Invalid address for this network: {s}"))
        })
}

/// The error for an account name with no registry entry.
pub(crate) fn invalid_account(name: &str) -> RpcError {
    LegacyCode::WalletInvalidAccountName.with_message(format!("Invalid account name: {name:?}"))
}

/// The error for an operation that needs key material while the wallet is
/// locked.
pub(crate) fn unlock_needed() -> RpcError {
    LegacyCode::WalletUnlockNeeded
        .with_static("Error: Please enter the wallet passphrase with walletpassphrase first.")
}

fn missing(name: &str) -> RpcError {
    LegacyCode::InvalidParams.with_message(format!("Invalid parameters, missing {name}."))
}

fn invalid_type(name: &str, expected: &str) -> RpcError {
    LegacyCode::InvalidParams.with_message(format!(
        "Invalid parameters, {name} must be {expected}."
    ))
}

fn out_of_range(name: &str) -> RpcError {
    LegacyCode::InvalidParameter.with_message(format!("Invalid parameter, {name} is out of range."))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn amounts_convert_btc_to_satoshis_exactly() {
        assert_eq!(
            amount_from_value(&json!(1.5), "amount").unwrap(),
            Amount::from_sat(150_000_000)
        );
        assert_eq!(
            amount_from_value(&json!(0.00000001), "amount").unwrap(),
            Amount::from_sat(1)
        );
        // Small values may arrive in scientific notation.
        let tiny: Value = serde_json::from_str("1e-7").unwrap();
        assert_eq!(
            amount_from_value(&tiny, "amount").unwrap(),
            Amount::from_sat(10)
        );
        assert_eq!(amount_from_value(&json!(0), "amount").unwrap(), Amount::ZERO);
    }

    #[test]
    fn negative_and_overprecise_amounts_are_rejected() {
        assert_eq!(
            amount_from_value(&json!(-1), "amount").unwrap_err().code,
            i32::from(LegacyCode::InvalidParameter)
        );
        assert!(amount_from_value(&json!(0.000000001), "amount").is_err());
        assert!(amount_from_value(&json!("1"), "amount").is_err());
    }

    #[test]
    fn minconf_defaults_and_rejects_negatives() {
        assert_eq!(opt_minconf_param(&[], 0).unwrap(), 1);
        assert_eq!(opt_minconf_param(&[json!(0)], 0).unwrap(), 0);
        assert_eq!(opt_minconf_param(&[json!(6)], 0).unwrap(), 6);
        assert_eq!(
            opt_minconf_param(&[json!(-1)], 0).unwrap_err().code,
            i32::from(LegacyCode::InvalidParameter)
        );
    }

    #[test]
    fn positional_params_accept_only_arrays() {
        assert!(params_array(&None).unwrap().is_empty());
        assert_eq!(params_array(&Some(json!([1]))).unwrap().len(), 1);
        assert!(params_array(&Some(json!({"a": 1}))).is_err());
    }
}
