//! Exact hexadecimal floating-point text.
//!
//! Formats and parses IEEE binary32/binary64/binary128 and the x87 80-bit
//! extended format as C99 `%a`-style text without ever going through a
//! narrower host type. Parsing rounds to nearest-even into the requested
//! layout, so the text form doubles as the precise intermediate used to
//! convert between floating formats.
//!
//! ```text
//! 3.0       -> 0x1.8p+1
//! -0.0      -> -0x0p+0
//! NaN       -> nan(0x8000000000000)
//! ```

use crate::error::{OffloadError, Result};

/// Bit layout of a binary floating-point format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatLayout {
    pub exp_bits: u32,
    /// Width of the stored significand field.
    pub field_bits: u32,
    /// The integer bit is stored explicitly (x87) instead of implied.
    pub explicit_int: bool,
}

impl FloatLayout {
    pub const F32: FloatLayout = FloatLayout {
        exp_bits: 8,
        field_bits: 23,
        explicit_int: false,
    };
    pub const F64: FloatLayout = FloatLayout {
        exp_bits: 11,
        field_bits: 52,
        explicit_int: false,
    };
    pub const X87: FloatLayout = FloatLayout {
        exp_bits: 15,
        field_bits: 64,
        explicit_int: true,
    };
    pub const QUAD: FloatLayout = FloatLayout {
        exp_bits: 15,
        field_bits: 112,
        explicit_int: false,
    };

    /// Significand precision in bits, integer bit included.
    fn precision(&self) -> u32 {
        if self.explicit_int {
            self.field_bits
        } else {
            self.field_bits + 1
        }
    }

    fn bias(&self) -> i64 {
        (1i64 << (self.exp_bits - 1)) - 1
    }

    fn max_biased(&self) -> u128 {
        (1u128 << self.exp_bits) - 1
    }

    fn field_mask(&self) -> u128 {
        (1u128 << self.field_bits) - 1
    }

    /// Mask of the NaN payload bits (everything below the integer bit).
    fn payload_mask(&self) -> u128 {
        if self.explicit_int {
            (1u128 << (self.field_bits - 1)) - 1
        } else {
            self.field_mask()
        }
    }

    fn quiet_bit(&self) -> u128 {
        if self.explicit_int {
            1u128 << (self.field_bits - 2)
        } else {
            1u128 << (self.field_bits - 1)
        }
    }

    fn sign_shift(&self) -> u32 {
        self.exp_bits + self.field_bits
    }
}

/// A floating-point value split into its mathematical parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoded {
    Zero { neg: bool },
    Inf { neg: bool },
    NaN { neg: bool, payload: u128 },
    /// `mant * 2^exp`, with `sticky` recording nonzero bits lost below `mant`.
    Finite {
        neg: bool,
        mant: u128,
        exp: i64,
        sticky: bool,
    },
}

fn decode(layout: FloatLayout, bits: u128) -> Decoded {
    let neg = (bits >> layout.sign_shift()) & 1 == 1;
    let biased = (bits >> layout.field_bits) & layout.max_biased();
    let field = bits & layout.field_mask();
    let p = layout.precision() as i64;
    let emin = 1 - layout.bias();

    if biased == layout.max_biased() {
        let payload = field & layout.payload_mask();
        return if payload == 0 {
            Decoded::Inf { neg }
        } else {
            Decoded::NaN { neg, payload }
        };
    }

    let (mant, exp) = if biased == 0 {
        (field, emin - (p - 1))
    } else if layout.explicit_int {
        (field, biased as i64 - layout.bias() - (p - 1))
    } else {
        (
            field | (1u128 << layout.field_bits),
            biased as i64 - layout.bias() - (p - 1),
        )
    };

    if mant == 0 {
        Decoded::Zero { neg }
    } else {
        Decoded::Finite {
            neg,
            mant,
            exp,
            sticky: false,
        }
    }
}

fn encode(layout: FloatLayout, value: Decoded) -> u128 {
    let sign = |neg: bool| (neg as u128) << layout.sign_shift();
    let int_bit = if layout.explicit_int {
        1u128 << (layout.field_bits - 1)
    } else {
        0
    };
    let inf = |neg: bool| sign(neg) | (layout.max_biased() << layout.field_bits) | int_bit;

    match value {
        Decoded::Zero { neg } => sign(neg),
        Decoded::Inf { neg } => inf(neg),
        Decoded::NaN { neg, payload } => {
            let mut payload = payload & layout.payload_mask();
            if payload == 0 {
                payload = layout.quiet_bit();
            }
            inf(neg) | payload
        }
        Decoded::Finite {
            neg,
            mant,
            exp,
            sticky,
        } => {
            let p = layout.precision() as i64;
            let emin = 1 - layout.bias();
            let emax = layout.bias();

            let msb = 127 - mant.leading_zeros() as i64;
            let e = msb + exp;
            if e > emax {
                return inf(neg);
            }
            let mut lsb_exp = if e >= emin { e - (p - 1) } else { emin - (p - 1) };

            let shift = lsb_exp - exp;
            let mut q = if shift <= 0 {
                mant << (-shift) as u32
            } else {
                round_shift(mant, shift as u32, sticky)
            };

            if q >> p != 0 {
                q >>= 1;
                lsb_exp += 1;
            }

            if q == 0 {
                return sign(neg);
            }

            if q >> (p - 1) != 0 {
                let biased = lsb_exp + (p - 1) + layout.bias();
                if biased >= layout.max_biased() as i64 {
                    return inf(neg);
                }
                let field = if layout.explicit_int {
                    q
                } else {
                    q & layout.field_mask()
                };
                sign(neg) | ((biased as u128) << layout.field_bits) | field
            } else {
                sign(neg) | q
            }
        }
    }
}

/// Shift `mant` right by `shift` bits, rounding to nearest-even.
fn round_shift(mant: u128, shift: u32, sticky: bool) -> u128 {
    if shift > 128 {
        return 0;
    }
    let kept = if shift == 128 { 0 } else { mant >> shift };
    let half_bit = (mant >> (shift - 1)) & 1 == 1;
    let rest_mask = if shift - 1 == 0 {
        0
    } else {
        (1u128 << (shift - 1)) - 1
    };
    let rest = (mant & rest_mask) != 0 || sticky;

    if half_bit && (rest || kept & 1 == 1) {
        kept + 1
    } else {
        kept
    }
}

/// Format raw bits of `layout` as hexadecimal floating-point text.
pub fn format_bits(layout: FloatLayout, bits: u128) -> String {
    match decode(layout, bits) {
        Decoded::Zero { neg } => format!("{}0x0p+0", if neg { "-" } else { "" }),
        Decoded::Inf { neg } => format!("{}inf", if neg { "-" } else { "" }),
        Decoded::NaN { neg, payload } => {
            format!("{}nan(0x{:x})", if neg { "-" } else { "" }, payload)
        }
        Decoded::Finite { neg, mant, exp, .. } => {
            let msb = 127 - mant.leading_zeros();
            let e = msb as i64 + exp;
            let frac = mant & ((1u128 << msb) - 1);
            let nibbles = msb.div_ceil(4) as usize;
            let prefix = if neg { "-" } else { "" };
            if nibbles == 0 || frac == 0 {
                return format!("{}0x1p{:+}", prefix, e);
            }
            let aligned = frac << (nibbles as u32 * 4 - msb);
            let digits = format!("{:0width$x}", aligned, width = nibbles);
            format!("{}0x1.{}p{:+}", prefix, digits.trim_end_matches('0'), e)
        }
    }
}

/// Parse hexadecimal floating-point text into raw bits of `layout`.
///
/// Accepts any C99 `%a` spelling (`0x3.0p-1`, `0X1P4`, `0x.8p0`), plus
/// `inf`, `infinity`, `nan` and `nan(0x<payload>)`.
pub fn parse_bits(layout: FloatLayout, text: &str) -> Result<u128> {
    let decoded = parse_decoded(text.trim())
        .ok_or_else(|| OffloadError::protocol(format!("invalid hex float '{}'", text)))?;
    Ok(encode(layout, decoded))
}

fn parse_decoded(text: &str) -> Option<Decoded> {
    let (neg, body) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let lower = body.to_ascii_lowercase();

    if lower == "inf" || lower == "infinity" {
        return Some(Decoded::Inf { neg });
    }
    if lower == "nan" {
        return Some(Decoded::NaN { neg, payload: 0 });
    }
    if let Some(inner) = lower.strip_prefix("nan(").and_then(|s| s.strip_suffix(')')) {
        let digits = inner.strip_prefix("0x").unwrap_or(inner);
        let payload = u128::from_str_radix(digits, 16).ok()?;
        return Some(Decoded::NaN { neg, payload });
    }

    let rest = lower.strip_prefix("0x")?;
    let (digits, exp_text) = match rest.split_once('p') {
        Some((d, e)) => (d, Some(e)),
        None => (rest, None),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let mut mant: u128 = 0;
    let mut exp: i64 = 0;
    let mut sticky = false;

    for c in int_part.chars() {
        let d = c.to_digit(16)? as u128;
        if mant >> 124 != 0 {
            exp += 4;
            sticky |= d != 0;
        } else {
            mant = (mant << 4) | d;
        }
    }
    for c in frac_part.chars() {
        let d = c.to_digit(16)? as u128;
        if mant >> 124 != 0 {
            sticky |= d != 0;
        } else {
            mant = (mant << 4) | d;
            exp -= 4;
        }
    }

    if let Some(exp_text) = exp_text {
        exp = exp.saturating_add(parse_exponent(exp_text)?);
    }

    if mant == 0 {
        return Some(Decoded::Zero { neg });
    }
    Some(Decoded::Finite {
        neg,
        mant,
        exp,
        sticky,
    })
}

/// Decimal binary exponent, clamped well outside every supported range.
fn parse_exponent(text: &str) -> Option<i64> {
    const LIMIT: i64 = 1 << 20;
    let (neg, digits) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut value: i64 = 0;
    for b in digits.bytes() {
        value = (value * 10 + (b - b'0') as i64).min(LIMIT);
    }
    Some(if neg { -value } else { value })
}

/// Convert raw bits between layouts, rounding to nearest-even.
///
/// NaN payloads keep their most significant bits.
pub fn convert_bits(from: FloatLayout, to: FloatLayout, bits: u128) -> u128 {
    let decoded = match decode(from, bits) {
        Decoded::NaN { neg, payload } => {
            let from_width = 128 - from.payload_mask().leading_zeros();
            let to_width = 128 - to.payload_mask().leading_zeros();
            let payload = if to_width >= from_width {
                payload << (to_width - from_width)
            } else {
                payload >> (from_width - to_width)
            };
            Decoded::NaN { neg, payload }
        }
        other => other,
    };
    encode(to, decoded)
}

pub fn format_f32(v: f32) -> String {
    format_bits(FloatLayout::F32, v.to_bits() as u128)
}

pub fn format_f64(v: f64) -> String {
    format_bits(FloatLayout::F64, v.to_bits() as u128)
}

pub fn parse_f32(text: &str) -> Result<f32> {
    Ok(f32::from_bits(parse_bits(FloatLayout::F32, text)? as u32))
}

pub fn parse_f64(text: &str) -> Result<f64> {
    Ok(f64::from_bits(parse_bits(FloatLayout::F64, text)? as u64))
}
