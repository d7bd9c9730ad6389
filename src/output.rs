//! Results output formatting (CSV).

use crate::analysis::{CellRecord, ColumnErrors};
use crate::error::Result;
use std::io::Write;

/// Write per-cell results as CSV, in the order given.
///
/// Format:
/// ```csv
/// cell,x,y,head,pressure,exact_pressure,vx,vy
/// 0,0.1,-9.9,-19.8,0.02,0.019,0.0,-1.02
/// ```
pub fn write_cells_csv<W: Write>(cells: &[CellRecord], writer: &mut W) -> Result<()> {
    writeln!(writer, "cell,x,y,head,pressure,exact_pressure,vx,vy")?;
    for r in cells {
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{}",
            r.global_id,
            r.centroid[0],
            r.centroid[1],
            r.head,
            r.pressure,
            r.exact_pressure,
            r.velocity[0],
            r.velocity[1]
        )?;
    }
    Ok(())
}

/// Write the error norms as CSV.
///
/// Format:
/// ```csv
/// Metric,Value
/// pressure_l2,0.036
/// ```
pub fn write_errors_csv<W: Write>(errors: &ColumnErrors, writer: &mut W) -> Result<()> {
    writeln!(writer, "Metric,Value")?;
    writeln!(writer, "pressure_l2,{}", errors.pressure)?;
    writeln!(writer, "flux_l2,{}", errors.flux)?;
    writeln!(writer, "divergence_l2,{}", errors.divergence)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_csv_has_header_and_rows() {
        let cells = [CellRecord {
            global_id: 3,
            centroid: [0.5, -1.0, 0.0],
            head: -2.0,
            pressure: 0.0,
            exact_pressure: 0.25,
            velocity: [0.0, -1.5, 0.0],
        }];
        let mut out = Vec::new();
        write_cells_csv(&cells, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "cell,x,y,head,pressure,exact_pressure,vx,vy");
        assert_eq!(lines[1], "3,0.5,-1,-2,0,0.25,0,-1.5");
    }

    #[test]
    fn errors_csv() {
        let errors = ColumnErrors {
            pressure: 0.5,
            flux: 0.25,
            divergence: 0.0,
        };
        let mut out = Vec::new();
        write_errors_csv(&errors, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Metric,Value\npressure_l2,0.5\nflux_l2,0.25\ndivergence_l2,0\n"
        );
    }
}
