//! Numeric encodings used by the pizza-box readout.
//!
//! Encoder counts arrive as 24-bit two's complement values written as
//! decimal integers; ADC samples arrive as 32-bit hex words whose upper 24
//! bits hold an 18-bit signed code scaled to volts by [`ADC_VOLTS_PER_COUNT`].
//! Decoders are bit-exact with the files the hardware writes. The encoders
//! exist for simulation and are exact inverses over the representable range.

/// Volts per ADC count.
pub const ADC_VOLTS_PER_COUNT: f64 = 7.629_394_531_25e-5;

/// Mask applied to positive raw encoder values.
const ENCODER_MASK: i64 = 0xFF_FFFE;

/// Largest magnitude of a decoded encoder count.
pub const ENCODER_COUNT_MAX: i64 = 0xFF_FFFF;

/// Largest positive ADC code.
const ADC_CODE_POSITIVE_MAX: i64 = 0x1_FFFF;

/// Offset of negative ADC codes.
const ADC_CODE_WRAP: i64 = 0x4_0000;

/// Decode a raw encoder word: `x` if `x <= 0`, else `-(x ^ 0xFFFFFE)`.
///
/// `0xFFFFFF` decodes to `-1`.
pub fn decode_encoder_count(raw: i64) -> i64 {
    if raw <= 0 {
        raw
    } else {
        -(raw ^ ENCODER_MASK)
    }
}

/// Raw encoder word for a count in `[-0xFFFFFF, 0]`.
///
/// `-0xFFFFFE` has no positive raw form and is written as-is, which the
/// decoder passes through unchanged.
pub fn encode_encoder_count(count: i64) -> Option<i64> {
    if !(-ENCODER_COUNT_MAX..=0).contains(&count) {
        return None;
    }
    if count == 0 {
        return Some(0);
    }
    match (-count) ^ ENCODER_MASK {
        0 => Some(count),
        raw => Some(raw),
    }
}

/// Decode a raw ADC word to volts.
pub fn decode_adc_raw(raw: u32) -> f64 {
    let code = i64::from(raw >> 8);
    if code > ADC_CODE_POSITIVE_MAX {
        (code - ADC_CODE_WRAP) as f64 * ADC_VOLTS_PER_COUNT
    } else {
        code as f64 * ADC_VOLTS_PER_COUNT
    }
}

/// Decode an ADC hex column (with or without `0x` prefix).
pub fn parse_adc_hex(text: &str) -> Option<f64> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16).ok().map(decode_adc_raw)
}

/// Signed ADC code for `volts`, if it is an exact multiple of a count within
/// the 18-bit range.
pub fn adc_code_for(volts: f64) -> Option<i64> {
    let code = (volts / ADC_VOLTS_PER_COUNT).round();
    if !code.is_finite() || code < -(ADC_CODE_WRAP / 2) as f64 || code > ADC_CODE_POSITIVE_MAX as f64
    {
        return None;
    }
    Some(code as i64)
}

/// Raw ADC word for `volts`.
pub fn encode_adc_volts(volts: f64) -> Option<u32> {
    let code = adc_code_for(volts)?;
    let unsigned = if code < 0 { code + ADC_CODE_WRAP } else { code };
    u32::try_from(unsigned << 8).ok()
}
