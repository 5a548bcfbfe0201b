//! Line-protocol rendering
//!
//! `<measurement> <field>=<value>[,<field>=<value>...] <timestamp_ns>`

use crate::decode::Measurement;
use std::fmt::Write;

/// Render one record as a line-protocol point stamped with `timestamp_ns`.
///
/// Field values use six decimal places.
pub fn format_line<M: Measurement>(record: &M, timestamp_ns: i64) -> String {
    let fields = record.fields();
    let mut line = String::with_capacity(M::NAME.len() + fields.len() * 16 + 21);
    line.push_str(M::NAME);
    line.push(' ');
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        // Writing to a String cannot fail
        let _ = write!(line, "{}={:.6}", key, value);
    }
    let _ = write!(line, " {}", timestamp_ns);
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Noise, Thermometer};

    #[test]
    fn test_noise_line() {
        let line = format_line(&Noise { value: 12.5 }, 1_700_000_000_000_000_000);
        assert_eq!(line, "noise_sensor val=12.500000 1700000000000000000");
    }

    #[test]
    fn test_thermometer_line() {
        let record = Thermometer {
            temperature: 21.25,
            humidity: 40.0,
        };
        assert_eq!(
            format_line(&record, 42),
            "thermometer_sensor tem=21.250000,hum=40.000000 42"
        );
    }

    #[test]
    fn test_negative_value() {
        let line = format_line(&Noise { value: -0.5 }, 1);
        assert_eq!(line, "noise_sensor val=-0.500000 1");
    }
}
