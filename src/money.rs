//! Minor-unit rounding and display of amounts.

use rust_decimal::{Decimal, RoundingStrategy};

/// Number of minor-unit digits for a currency code.
pub fn decimal_places(code: &str) -> u32 {
    match code {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX"
        | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        _ => 2,
    }
}

/// Rounds half to even at the currency's minor unit.
pub fn round_amount(amount: Decimal, code: &str) -> Decimal {
    amount.round_dp_with_strategy(decimal_places(code), RoundingStrategy::MidpointNearestEven)
}

/// `1234567.5` in USD renders as `1,234,567.50`.
pub fn format_amount(amount: Decimal, code: &str) -> String {
    let places = decimal_places(code);
    let rounded = round_amount(amount, code);
    let text = format!("{:.*}", places as usize, rounded.abs());

    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (text.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}
