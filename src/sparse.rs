//! Sparse matrix utilities.
//!
//! Helper functions for working with nalgebra-sparse matrices.

use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;

use crate::error::{NlError, Result};

/// Create a CSR matrix from per-row `(col, value)` entries.
///
/// Entries of a row are sorted by column, duplicates are summed together and
/// values with absolute value at most `zero_tol` are dropped.
pub fn csr_from_rows(ncols: usize, rows: &[Vec<(usize, f64)>], zero_tol: f64) -> Result<CsrMatrix<f64>> {
    let mut row_offsets = Vec::with_capacity(rows.len() + 1);
    let mut col_indices = Vec::new();
    let mut values = Vec::new();
    row_offsets.push(0);

    for row in rows {
        let mut entries = row.clone();
        entries.sort_by_key(|(c, _)| *c);
        let mut combined: Vec<(usize, f64)> = Vec::with_capacity(entries.len());
        for (c, v) in entries {
            if let Some((lc, lv)) = combined.last_mut() {
                if *lc == c {
                    *lv += v;
                    continue;
                }
            }
            combined.push((c, v));
        }
        for (c, v) in combined {
            if v.abs() > zero_tol {
                col_indices.push(c);
                values.push(v);
            }
        }
        row_offsets.push(col_indices.len());
    }

    CsrMatrix::try_from_csr_data(rows.len(), ncols, row_offsets, col_indices, values)
        .map_err(|e| NlError::NumericalError(format!("invalid sparse pattern: {}", e)))
}

/// Dot product of a row with a dense vector.
pub fn csr_row_dot(m: &CsrMatrix<f64>, row: usize, x: &[f64]) -> f64 {
    let r = m.row(row);
    r.col_indices()
        .iter()
        .zip(r.values())
        .map(|(&c, v)| v * x[c])
        .sum()
}

/// Convert CSR to dense matrix.
pub fn csr_to_dense(sparse: &CsrMatrix<f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(sparse.nrows(), sparse.ncols());
    for (row, col, val) in sparse.triplet_iter() {
        dense[(row, col)] = *val;
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_from_rows_sorts_and_drops_zeros() {
        let rows = vec![
            vec![(2, 1.0), (0, 3.0), (2, -1.0)],
            vec![],
            vec![(1, 1e-14), (1, 2.0)],
        ];
        let m = csr_from_rows(3, &rows, 1e-12).unwrap();
        assert_eq!(m.nrows(), 3);
        assert_eq!(m.row_offsets(), &[0, 1, 1, 2]);
        assert_eq!(m.col_indices(), &[0, 1]);
        assert_eq!(m.values()[0], 3.0);
    }

    #[test]
    fn test_csr_row_dot() {
        let m = csr_from_rows(3, &[vec![(0, 1.0), (2, 2.0)]], 0.0).unwrap();
        assert_eq!(csr_row_dot(&m, 0, &[1.0, 5.0, 3.0]), 7.0);
        let d = csr_to_dense(&m);
        assert_eq!(d[(0, 2)], 2.0);
        assert_eq!(d[(0, 1)], 0.0);
    }

    #[test]
    fn test_csr_from_rows_rejects_out_of_range_column() {
        assert!(csr_from_rows(2, &[vec![(5, 1.0)]], 0.0).is_err());
    }
}
