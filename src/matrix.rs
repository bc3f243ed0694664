//! Batch buffers and zero-copy strided views.
//!
//! Every buffer the evaluator touches is a `rows x cols` matrix where `rows`
//! is the feature width and `cols` is the batch size. The memory ordering is
//! declared per buffer with [`MatrixLayout`] and all strides are derived from
//! it, so a sample's features can either sit next to each other
//! ([`MatrixLayout::ColumnMajor`]) or each feature row can be contiguous across
//! the batch ([`MatrixLayout::RowMajor`]).
//!
//! [`Matrix::slice_rows`] hands out a view of a contiguous band of feature rows
//! without copying; this is how the packed color-network input is shared
//! between the direction encoding and the uv head.
//!
//! ## Example
//!
//! ```rust
//! use briny_field::matrix::{Matrix, MatrixLayout};
//!
//! let m = Matrix::from_fn(4, 2, MatrixLayout::ColumnMajor, |r, c| (r * 10 + c) as f32);
//! let band = m.slice_rows(1, 2);
//! assert_eq!(band.get(0, 1), 11.0);
//! assert_eq!(band.get(1, 0), 20.0);
//! ```

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Memory ordering of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MatrixLayout {
    /// Each column (one sample) is contiguous.
    #[default]
    ColumnMajor,
    /// Each row (one feature across the batch) is contiguous.
    RowMajor,
}

impl MatrixLayout {
    /// Array-of-structures, the column-major ordering.
    pub const AOS: Self = Self::ColumnMajor;
    /// Structure-of-arrays, the row-major ordering.
    pub const SOA: Self = Self::RowMajor;

    #[inline]
    const fn stride(self, rows: usize, cols: usize) -> usize {
        match self {
            Self::ColumnMajor => rows,
            Self::RowMajor => cols,
        }
    }

    #[inline]
    const fn offset(self, stride: usize, row: usize, col: usize) -> usize {
        match self {
            Self::ColumnMajor => col * stride + row,
            Self::RowMajor => row * stride + col,
        }
    }
}

#[inline]
fn required_len(layout: MatrixLayout, rows: usize, cols: usize, stride: usize) -> usize {
    if rows == 0 || cols == 0 {
        return 0;
    }
    layout.offset(stride, rows - 1, cols - 1) + 1
}

/// An owned `rows x cols` buffer with a declared memory ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
    layout: MatrixLayout,
}

impl<T: Copy + Default> Matrix<T> {
    /// Creates a matrix filled with `T::default()`.
    pub fn zeros(rows: usize, cols: usize, layout: MatrixLayout) -> Self {
        Self {
            data: vec![T::default(); rows * cols],
            rows,
            cols,
            layout,
        }
    }

    /// Builds a matrix by evaluating `f(row, col)` for every element.
    pub fn from_fn(
        rows: usize,
        cols: usize,
        layout: MatrixLayout,
        mut f: impl FnMut(usize, usize) -> T,
    ) -> Self {
        let mut m = Self::zeros(rows, cols, layout);
        for c in 0..cols {
            for r in 0..rows {
                m.set(r, c, f(r, c));
            }
        }
        m
    }
}

impl<T> Matrix<T> {
    /// Wraps existing storage.
    ///
    /// # Panics
    /// Panics if `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, layout: MatrixLayout, data: Vec<T>) -> Self {
        assert_eq!(
            rows * cols,
            data.len(),
            "{rows}x{cols} matrix is incompatible with {} data elements",
            data.len()
        );
        Self {
            data,
            rows,
            cols,
            layout,
        }
    }

    /// Feature width.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Batch size.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Declared memory ordering.
    pub fn layout(&self) -> MatrixLayout {
        self.layout
    }

    /// Distance between consecutive lanes.
    pub fn stride(&self) -> usize {
        self.layout.stride(self.rows, self.cols)
    }

    /// Total number of elements.
    pub fn n_elements(&self) -> usize {
        self.data.len()
    }

    /// Raw storage in declared order.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable raw storage in declared order.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the matrix, returning its storage.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Borrows the whole matrix.
    pub fn view(&self) -> MatrixView<'_, T> {
        MatrixView {
            data: &self.data,
            rows: self.rows,
            cols: self.cols,
            stride: self.stride(),
            layout: self.layout,
        }
    }

    /// Mutably borrows the whole matrix.
    pub fn view_mut(&mut self) -> MatrixViewMut<'_, T> {
        let stride = self.stride();
        MatrixViewMut {
            data: &mut self.data,
            rows: self.rows,
            cols: self.cols,
            stride,
            layout: self.layout,
        }
    }

    /// Zero-copy view of rows `offset..offset + count`.
    pub fn slice_rows(&self, offset: usize, count: usize) -> MatrixView<'_, T> {
        self.view().slice_rows(offset, count)
    }

    /// Zero-copy mutable view of rows `offset..offset + count`.
    pub fn slice_rows_mut(&mut self, offset: usize, count: usize) -> MatrixViewMut<'_, T> {
        self.view_mut().into_slice_rows(offset, count)
    }
}

impl<T: Copy> Matrix<T> {
    /// Reads element `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> T {
        self.view().get(row, col)
    }

    /// Writes element `(row, col)`.
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        let idx = self.layout.offset(self.stride(), row, col);
        self.data[idx] = value;
    }
}

/// A borrowed, possibly strided, read-only matrix.
#[derive(Debug)]
pub struct MatrixView<'a, T> {
    data: &'a [T],
    rows: usize,
    cols: usize,
    stride: usize,
    layout: MatrixLayout,
}

impl<T> Clone for MatrixView<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MatrixView<'_, T> {}

impl<'a, T> MatrixView<'a, T> {
    /// Interprets a dense slice as a matrix.
    ///
    /// # Panics
    /// Panics if `data` is too short for the requested shape.
    pub fn from_slice(data: &'a [T], rows: usize, cols: usize, layout: MatrixLayout) -> Self {
        let stride = layout.stride(rows, cols);
        assert!(
            data.len() >= required_len(layout, rows, cols, stride),
            "slice of {} elements cannot hold a {rows}x{cols} matrix",
            data.len()
        );
        Self {
            data,
            rows,
            cols,
            stride,
            layout,
        }
    }

    /// Feature width.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Batch size.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Distance between consecutive lanes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Declared memory ordering.
    pub fn layout(&self) -> MatrixLayout {
        self.layout
    }

    /// Number of addressable elements.
    pub fn n_elements(&self) -> usize {
        self.rows * self.cols
    }

    /// Zero-copy view of rows `offset..offset + count`.
    ///
    /// # Panics
    /// Panics if the band extends past the last row.
    pub fn slice_rows(&self, offset: usize, count: usize) -> MatrixView<'a, T> {
        assert!(
            offset + count <= self.rows,
            "rows {offset}..{} out of range for a {}-row view",
            offset + count,
            self.rows
        );
        let start = match self.layout {
            MatrixLayout::ColumnMajor => offset,
            MatrixLayout::RowMajor => offset * self.stride,
        };
        let data: &'a [T] = self.data;
        MatrixView {
            data: data.get(start..).unwrap_or(&[]),
            rows: count,
            cols: self.cols,
            stride: self.stride,
            layout: self.layout,
        }
    }

    /// Whether the view covers a dense region of memory.
    pub fn is_contiguous(&self) -> bool {
        match self.layout {
            MatrixLayout::ColumnMajor => self.stride == self.rows || self.cols <= 1,
            MatrixLayout::RowMajor => self.stride == self.cols || self.rows <= 1,
        }
    }

    /// The dense backing slice, if [`is_contiguous`](Self::is_contiguous).
    pub fn as_slice(&self) -> Option<&'a [T]> {
        let data: &'a [T] = self.data;
        self.is_contiguous().then(|| &data[..self.n_elements()])
    }
}

impl<'a, T: Copy> MatrixView<'a, T> {
    /// Reads element `(row, col)`.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[self.layout.offset(self.stride, row, col)]
    }

    /// Gathers one sample.
    pub fn column(&self, col: usize) -> Vec<T> {
        (0..self.rows).map(|r| self.get(r, col)).collect()
    }

    /// Gathers one feature row across the batch.
    pub fn row(&self, row: usize) -> Vec<T> {
        (0..self.cols).map(|c| self.get(row, c)).collect()
    }

    /// Copies the view into a compact matrix of the same ordering.
    pub fn to_matrix(&self) -> Matrix<T>
    where
        T: Default,
    {
        Matrix::from_fn(self.rows, self.cols, self.layout, |r, c| self.get(r, c))
    }
}

impl<T: Copy + Send + Sync> MatrixView<'_, T> {
    /// Runs `f(col, sample)` for every column in parallel and collects the
    /// results in column order.
    pub fn par_map_columns<U, F>(&self, f: F) -> Vec<U>
    where
        U: Send,
        F: Fn(usize, &[T]) -> U + Sync + Send,
    {
        let view = *self;
        match self.layout {
            MatrixLayout::ColumnMajor => (0..view.cols)
                .into_par_iter()
                .map(|c| {
                    let start = c * view.stride;
                    f(c, &view.data[start..start + view.rows])
                })
                .collect(),
            MatrixLayout::RowMajor => (0..view.cols)
                .into_par_iter()
                .map(|c| f(c, view.column(c).as_slice()))
                .collect(),
        }
    }
}

/// A borrowed, possibly strided, mutable matrix.
#[derive(Debug)]
pub struct MatrixViewMut<'a, T> {
    data: &'a mut [T],
    rows: usize,
    cols: usize,
    stride: usize,
    layout: MatrixLayout,
}

impl<'a, T> MatrixViewMut<'a, T> {
    /// Interprets a dense mutable slice as a matrix.
    ///
    /// # Panics
    /// Panics if `data` is too short for the requested shape.
    pub fn from_slice(data: &'a mut [T], rows: usize, cols: usize, layout: MatrixLayout) -> Self {
        let stride = layout.stride(rows, cols);
        assert!(
            data.len() >= required_len(layout, rows, cols, stride),
            "slice of {} elements cannot hold a {rows}x{cols} matrix",
            data.len()
        );
        Self {
            data,
            rows,
            cols,
            stride,
            layout,
        }
    }

    /// Feature width.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Batch size.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Distance between consecutive lanes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Declared memory ordering.
    pub fn layout(&self) -> MatrixLayout {
        self.layout
    }

    /// Number of addressable elements.
    pub fn n_elements(&self) -> usize {
        self.rows * self.cols
    }

    /// Read-only view of the same region.
    pub fn as_view(&self) -> MatrixView<'_, T> {
        MatrixView {
            data: &*self.data,
            rows: self.rows,
            cols: self.cols,
            stride: self.stride,
            layout: self.layout,
        }
    }

    /// Shortens the borrow so the view can be handed out repeatedly.
    pub fn reborrow(&mut self) -> MatrixViewMut<'_, T> {
        MatrixViewMut {
            data: &mut *self.data,
            rows: self.rows,
            cols: self.cols,
            stride: self.stride,
            layout: self.layout,
        }
    }

    /// Zero-copy mutable view of rows `offset..offset + count`.
    pub fn slice_rows_mut(&mut self, offset: usize, count: usize) -> MatrixViewMut<'_, T> {
        self.reborrow().into_slice_rows(offset, count)
    }

    /// Consuming form of [`slice_rows_mut`](Self::slice_rows_mut).
    ///
    /// # Panics
    /// Panics if the band extends past the last row.
    pub fn into_slice_rows(self, offset: usize, count: usize) -> MatrixViewMut<'a, T> {
        assert!(
            offset + count <= self.rows,
            "rows {offset}..{} out of range for a {}-row view",
            offset + count,
            self.rows
        );
        let start = match self.layout {
            MatrixLayout::ColumnMajor => offset,
            MatrixLayout::RowMajor => offset * self.stride,
        };
        let data = self.data;
        let start = start.min(data.len());
        MatrixViewMut {
            data: &mut data[start..],
            rows: count,
            cols: self.cols,
            stride: self.stride,
            layout: self.layout,
        }
    }

    /// Whether the view covers a dense region of memory.
    pub fn is_contiguous(&self) -> bool {
        self.as_view().is_contiguous()
    }

    /// The dense backing slice, if the view is contiguous.
    pub fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        let n = self.n_elements();
        if self.is_contiguous() {
            Some(&mut self.data[..n])
        } else {
            None
        }
    }

    /// Parallel iterator over the contiguous lanes of the view: columns for
    /// column-major views, rows for row-major ones.
    pub fn par_lanes_mut(&mut self) -> impl IndexedParallelIterator<Item = &mut [T]>
    where
        T: Send,
    {
        let (n_lanes, lane_len) = match self.layout {
            MatrixLayout::ColumnMajor => (self.cols, self.rows),
            MatrixLayout::RowMajor => (self.rows, self.cols),
        };
        self.data
            .par_chunks_mut(self.stride.max(1))
            .take(n_lanes)
            .map(move |lane| &mut lane[..lane_len])
    }

    /// Calls `f(row, col, &mut element)` for every element, in parallel over lanes.
    pub fn par_for_each_mut<F>(&mut self, f: F)
    where
        T: Send,
        F: Fn(usize, usize, &mut T) + Sync + Send,
    {
        let layout = self.layout;
        self.par_lanes_mut()
            .enumerate()
            .for_each(|(lane, values)| {
                for (k, v) in values.iter_mut().enumerate() {
                    let (r, c) = match layout {
                        MatrixLayout::ColumnMajor => (k, lane),
                        MatrixLayout::RowMajor => (lane, k),
                    };
                    f(r, c, v);
                }
            });
    }
}

impl<T: Copy> MatrixViewMut<'_, T> {
    /// Reads element `(row, col)`.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[self.layout.offset(self.stride, row, col)]
    }

    /// Writes element `(row, col)`.
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[self.layout.offset(self.stride, row, col)] = value;
    }

    /// Writes the leading `values.len()` rows of column `col`.
    pub fn set_column(&mut self, col: usize, values: &[T]) {
        for (r, &v) in values.iter().take(self.rows).enumerate() {
            self.set(r, col, v);
        }
    }

    /// Scatters per-sample results produced by [`MatrixView::par_map_columns`].
    pub fn write_columns<C: AsRef<[T]>>(&mut self, columns: &[C]) {
        for (c, values) in columns.iter().enumerate().take(self.cols) {
            self.set_column(c, values.as_ref());
        }
    }
}

impl<T: Copy + Send> MatrixViewMut<'_, T> {
    /// Sets every element of the view.
    pub fn fill(&mut self, value: T)
    where
        T: Sync,
    {
        self.par_lanes_mut().for_each(|lane| lane.fill(value));
    }
}
