//! Filtering and normalization of raw count matrices.
//!
//! Matrices are cells × genes `CsrMatrix` values as produced by the sequencing pipeline. Every
//! function returns a new `f64` matrix; filters also return the indices of the rows or
//! columns they kept so callers can carry cell and gene annotations along.

use anyhow::anyhow;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::Array2;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;

/// Criteria for [`drop_cells`]. A cell is kept only if it passes every criterion that is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellFilter {
    /// Minimum total counts.
    pub min_counts: Option<f64>,
    /// Minimum number of genes with a count of at least `read_threshold`.
    pub min_genes: Option<usize>,
    /// Restrict both criteria to these gene columns.
    pub genes: Option<Vec<usize>>,
    pub read_threshold: f64,
}

impl Default for CellFilter {
    fn default() -> Self {
        CellFilter {
            min_counts: None,
            min_genes: None,
            genes: None,
            read_threshold: 1.0,
        }
    }
}

impl CellFilter {
    pub fn with_min_counts(mut self, min_counts: f64) -> Self {
        self.min_counts = Some(min_counts);
        self
    }

    pub fn with_min_genes(mut self, min_genes: usize) -> Self {
        self.min_genes = Some(min_genes);
        self
    }

    pub fn with_genes(mut self, genes: Vec<usize>) -> Self {
        self.genes = Some(genes);
        self
    }

    pub fn with_read_threshold(mut self, read_threshold: f64) -> Self {
        self.read_threshold = read_threshold;
        self
    }
}

/// Criteria for [`drop_genes`]. A gene is kept only if it passes every criterion that is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneFilter {
    /// Minimum total counts over all cells.
    pub min_counts: Option<f64>,
    /// Minimum number of cells with a count of at least `read_threshold`.
    pub min_cells: Option<usize>,
    pub read_threshold: f64,
}

impl Default for GeneFilter {
    fn default() -> Self {
        GeneFilter {
            min_counts: None,
            min_cells: None,
            read_threshold: 1.0,
        }
    }
}

impl GeneFilter {
    pub fn with_min_counts(mut self, min_counts: f64) -> Self {
        self.min_counts = Some(min_counts);
        self
    }

    pub fn with_min_cells(mut self, min_cells: usize) -> Self {
        self.min_cells = Some(min_cells);
        self
    }

    pub fn with_read_threshold(mut self, read_threshold: f64) -> Self {
        self.read_threshold = read_threshold;
        self
    }
}

#[inline]
pub(crate) fn value_f64<T: FloatOpsTS>(value: T) -> f64 {
    ToPrimitive::to_f64(&value).unwrap_or(f64::NAN)
}

/// Remove low-quality cells (rows).
///
/// # Returns
///
/// The filtered matrix and the original row index of every kept cell.
pub fn drop_cells<T>(
    matrix: &CsrMatrix<T>,
    filter: &CellFilter,
) -> anyhow::Result<(CsrMatrix<f64>, Vec<usize>)>
where
    T: FloatOpsTS,
{
    if filter.min_counts.is_none() && filter.min_genes.is_none() {
        return Err(anyhow!("CellFilter needs min_counts or min_genes"));
    }

    let mut relevant = vec![filter.genes.is_none(); matrix.ncols()];
    if let Some(genes) = &filter.genes {
        for &gene in genes {
            let slot = relevant.get_mut(gene).ok_or_else(|| {
                anyhow!("Gene index {} out of bounds for {} genes", gene, matrix.ncols())
            })?;
            *slot = true;
        }
    }

    let kept: Vec<usize> = matrix
        .row_iter()
        .enumerate()
        .filter(|(_, row)| {
            let mut total = 0.0;
            let mut expressed = 0;
            for (&gene, &value) in row.col_indices().iter().zip(row.values()) {
                if relevant[gene] {
                    let value = value_f64(value);
                    total += value;
                    if value >= filter.read_threshold {
                        expressed += 1;
                    }
                }
            }
            filter.min_counts.is_none_or(|min| total >= min)
                && filter.min_genes.is_none_or(|min| expressed >= min)
        })
        .map(|(i, _)| i)
        .collect();

    Ok((select_rows(matrix, &kept)?, kept))
}

/// Remove rarely detected genes (columns).
///
/// # Returns
///
/// The filtered matrix and the original column index of every kept gene.
pub fn drop_genes<T>(
    matrix: &CsrMatrix<T>,
    filter: &GeneFilter,
) -> anyhow::Result<(CsrMatrix<f64>, Vec<usize>)>
where
    T: FloatOpsTS,
{
    if filter.min_counts.is_none() && filter.min_cells.is_none() {
        return Err(anyhow!("GeneFilter needs min_counts or min_cells"));
    }

    let n_genes = matrix.ncols();
    let mut totals = vec![0.0; n_genes];
    let mut detected = vec![0usize; n_genes];
    for (_, gene, &value) in matrix.triplet_iter() {
        let value = value_f64(value);
        totals[gene] += value;
        if value >= filter.read_threshold {
            detected[gene] += 1;
        }
    }

    let kept: Vec<usize> = (0..n_genes)
        .filter(|&gene| {
            filter.min_counts.is_none_or(|min| totals[gene] >= min)
                && filter.min_cells.is_none_or(|min| detected[gene] >= min)
        })
        .collect();

    Ok((select_columns(matrix, &kept)?, kept))
}

/// `ln(x + 1)` of every stored entry. Implicit zeros stay zero.
pub fn log_normalize<T>(matrix: &CsrMatrix<T>) -> anyhow::Result<CsrMatrix<f64>>
where
    T: FloatOpsTS,
{
    let values: Vec<f64> = matrix.values().iter().map(|&v| value_f64(v).ln_1p()).collect();
    CsrMatrix::try_from_csr_data(
        matrix.nrows(),
        matrix.ncols(),
        matrix.row_offsets().to_vec(),
        matrix.col_indices().to_vec(),
        values,
    )
    .map_err(|e| anyhow!("Failed to rebuild normalized matrix: {}", e))
}

/// Orderings of cells and genes by descending total expression.
///
/// Cell totals are taken over `genes` when given. Ties keep their original order.
pub fn sort_by_expression<T>(
    matrix: &CsrMatrix<T>,
    genes: Option<&[usize]>,
) -> anyhow::Result<(Vec<usize>, Vec<usize>)>
where
    T: FloatOpsTS,
{
    let mut relevant = vec![genes.is_none(); matrix.ncols()];
    for &gene in genes.unwrap_or_default() {
        let slot = relevant.get_mut(gene).ok_or_else(|| {
            anyhow!("Gene index {} out of bounds for {} genes", gene, matrix.ncols())
        })?;
        *slot = true;
    }

    let mut cell_totals = vec![0.0; matrix.nrows()];
    let mut gene_totals = vec![0.0; matrix.ncols()];
    for (cell, gene, &value) in matrix.triplet_iter() {
        let value = value_f64(value);
        gene_totals[gene] += value;
        if relevant[gene] {
            cell_totals[cell] += value;
        }
    }

    Ok((descending_order(&cell_totals), descending_order(&gene_totals)))
}

fn descending_order(totals: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..totals.len()).collect();
    order.sort_by(|&a, &b| {
        totals[b]
            .partial_cmp(&totals[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

/// Dense copy of a sparse matrix, ready for the clustering routines.
pub fn to_dense<T>(matrix: &CsrMatrix<T>) -> Array2<f64>
where
    T: FloatOpsTS,
{
    let mut dense = Array2::zeros((matrix.nrows(), matrix.ncols()));
    for (row, col, &value) in matrix.triplet_iter() {
        dense[[row, col]] += value_f64(value);
    }
    dense
}

fn select_rows<T>(matrix: &CsrMatrix<T>, rows: &[usize]) -> anyhow::Result<CsrMatrix<f64>>
where
    T: FloatOpsTS,
{
    let mut coo = CooMatrix::new(rows.len(), matrix.ncols());
    for (new_row, &row) in rows.iter().enumerate() {
        let source = matrix
            .get_row(row)
            .ok_or_else(|| anyhow!("Row index {} out of bounds", row))?;
        for (&col, &value) in source.col_indices().iter().zip(source.values()) {
            coo.push(new_row, col, value_f64(value));
        }
    }
    Ok(CsrMatrix::from(&coo))
}

fn select_columns<T>(matrix: &CsrMatrix<T>, cols: &[usize]) -> anyhow::Result<CsrMatrix<f64>>
where
    T: FloatOpsTS,
{
    let mut remap = vec![None; matrix.ncols()];
    for (new_col, &col) in cols.iter().enumerate() {
        let slot = remap
            .get_mut(col)
            .ok_or_else(|| anyhow!("Column index {} out of bounds", col))?;
        *slot = Some(new_col);
    }

    let mut coo = CooMatrix::new(matrix.nrows(), cols.len());
    for (row, col, &value) in matrix.triplet_iter() {
        if let Some(new_col) = remap[col] {
            coo.push(row, new_col, value_f64(value));
        }
    }
    Ok(CsrMatrix::from(&coo))
}
