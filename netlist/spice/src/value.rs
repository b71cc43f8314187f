//! Numeric formatting for SPICE output.

/// Formats a value the way C's `%.*g` would: `prec` significant digits,
/// scientific notation for very large or small magnitudes, no trailing
/// zeros.
pub fn g_format(v: f64, prec: usize) -> String {
    if v == 0.0 {
        return "0".to_string();
    }
    let prec = prec.max(1);
    let exp = v.abs().log10().floor() as i32;
    if exp < -4 || exp >= prec as i32 {
        let s = format!("{:.*e}", prec - 1, v);
        // Trim trailing zeros in the mantissa: "2.500e-6" -> "2.5e-6".
        match s.split_once('e') {
            Some((mant, e)) => {
                let mant = if mant.contains('.') {
                    mant.trim_end_matches('0').trim_end_matches('.')
                } else {
                    mant
                };
                format!("{mant}e{e}")
            }
            None => s,
        }
    } else {
        let decimals = (prec as i32 - 1 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, v);
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    }
}

/// Formats a value with the SI suffix SPICE simulators understand.
///
/// The precision adapts: start at 3 significant digits and widen until the
/// printed form round-trips to the input within 1e-6.
pub fn si_value(value: f64) -> String {
    let avalue = value.abs();
    let (value, suffix) = if avalue < 1.0e-18 {
        // Probably zero.
        (value, None)
    } else if avalue < 0.9999e-13 {
        // ngspice does not accept "a" for atto.
        (value * 1.0e15, Some('f'))
    } else if avalue < 1.0001e-10 {
        (value * 1.0e12, Some('p'))
    } else if avalue < 1.0001e-7 {
        (value * 1.0e9, Some('n'))
    } else if avalue < 1.0001e-4 {
        (value * 1.0e6, Some('u'))
    } else if avalue < 1.0001e-2 {
        (value * 1.0e3, Some('m'))
    } else if avalue > 0.9999e9 {
        (value / 1.0e9, Some('G'))
    } else if avalue > 0.9999e3 {
        (value / 1.0e3, Some('k'))
    } else {
        (value, None)
    };

    let mut printed = g_format(value, 3);
    for precision in 3..9 {
        printed = g_format(value, precision);
        let back: f64 = printed.parse().unwrap_or(0.0);
        let vtrunc = (0.5 + value * 1e6) as i64;
        let ptrunc = (0.5 + back * 1e6) as i64;
        if vtrunc == ptrunc {
            break;
        }
    }

    match suffix {
        Some(c) => format!("{printed}{c}"),
        None => printed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_table() {
        assert_eq!(si_value(0.0), "0");
        assert_eq!(si_value(2.0e-6), "2u");
        assert_eq!(si_value(1.5e-15), "1.5f");
        assert_eq!(si_value(3.0e-12), "3p");
        assert_eq!(si_value(4.7e-9), "4.7n");
        assert_eq!(si_value(1.0e-3), "1m");
        assert_eq!(si_value(2.2e4), "22k");
        assert_eq!(si_value(3.0e9), "3G");
        assert_eq!(si_value(5.0), "5");
    }

    #[test]
    fn precision_widens_until_round_trip() {
        // 3 significant digits cannot represent this value to within 1e-6.
        assert_eq!(si_value(1.23456e-4), "0.123456m");
    }

    #[test]
    fn g_format_trims_zeros() {
        assert_eq!(g_format(2.5, 6), "2.5");
        assert_eq!(g_format(0.000002, 6), "2e-6");
        assert_eq!(g_format(1234.0, 6), "1234");
    }
}
