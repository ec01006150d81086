//! Core tensor types and fundamental operations

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use super::devices::Device;
use crate::error::{LossError, LossResult};

/// Row-major 2-D shape; scalars are `[1, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: [usize; 2],
}

impl Shape {
    pub fn new(dims: [usize; 2]) -> Self {
        Self { dims }
    }

    pub fn scalar() -> Self {
        Self { dims: [1, 1] }
    }

    pub fn rows(&self) -> usize {
        self.dims[0]
    }

    pub fn cols(&self) -> usize {
        self.dims[1]
    }

    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims == [1, 1]
    }

    /// Numpy-style broadcast of two shapes: each axis must match or be 1
    pub fn broadcast(&self, other: &Shape) -> LossResult<Shape> {
        let mut dims = [0; 2];
        for axis in 0..2 {
            let (a, b) = (self.dims[axis], other.dims[axis]);
            dims[axis] = if a == b {
                a
            } else if a == 1 {
                b
            } else if b == 1 {
                a
            } else {
                return Err(LossError::shape_error(
                    &self.to_string(),
                    &other.to_string(),
                    Some("operands must agree on every axis or have size 1 there"),
                ));
            };
        }
        Ok(Shape { dims })
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.dims[0], self.dims[1])
    }
}

/// Dense f64 matrix tagged with the device it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f64>,
    device: Device,
}

impl Tensor {
    pub fn zeros(shape: Shape, device: Device) -> Self {
        Self::full(shape, 0.0, device)
    }

    pub fn ones(shape: Shape, device: Device) -> Self {
        Self::full(shape, 1.0, device)
    }

    pub fn full(shape: Shape, value: f64, device: Device) -> Self {
        Self {
            shape,
            data: vec![value; shape.total_elements()],
            device,
        }
    }

    pub fn scalar(value: f64) -> Self {
        Self::full(Shape::scalar(), value, Device::Cpu)
    }

    pub fn from_vec(data: Vec<f64>, shape: Shape, device: Device) -> LossResult<Self> {
        if data.len() != shape.total_elements() {
            return Err(LossError::shape_error(
                &format!("{} elements for shape {}", shape.total_elements(), shape),
                &format!("{} elements", data.len()),
                None,
            ));
        }
        Ok(Self { shape, data, device })
    }

    /// Build a CPU matrix from equally long rows
    pub fn from_rows(rows: &[Vec<f64>]) -> LossResult<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(LossError::shape_error(
                &format!("rows of length {}", cols),
                &format!("a row of length {}", bad.len()),
                None,
            ));
        }
        let data = rows.iter().flatten().copied().collect();
        Self::from_vec(data, Shape::new([rows.len(), cols]), Device::Cpu)
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    pub fn cols(&self) -> usize {
        self.shape.cols()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_slice_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols() + col]
    }

    /// Value of a `[1, 1]` tensor
    pub fn item(&self) -> LossResult<f64> {
        if !self.shape.is_scalar() {
            return Err(LossError::shape_error("[1, 1]", &self.shape.to_string(), None));
        }
        Ok(self.data[0])
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f64) -> f64,
    {
        Tensor {
            shape: self.shape,
            data: self.data.iter().map(|&v| f(v)).collect(),
            device: self.device,
        }
    }

    /// Element-wise binary op with broadcasting
    pub fn zip_with<F>(&self, other: &Tensor, f: F) -> LossResult<Tensor>
    where
        F: Fn(f64, f64) -> f64,
    {
        self.device.ensure_same(other.device, "element-wise op")?;
        let shape = self.shape.broadcast(&other.shape)?;
        let mut data = Vec::with_capacity(shape.total_elements());
        for r in 0..shape.rows() {
            for c in 0..shape.cols() {
                data.push(f(self.broadcast_get(r, c), other.broadcast_get(r, c)));
            }
        }
        Ok(Tensor { shape, data, device: self.device })
    }

    fn broadcast_get(&self, row: usize, col: usize) -> f64 {
        let r = if self.rows() == 1 { 0 } else { row };
        let c = if self.cols() == 1 { 0 } else { col };
        self.get(r, c)
    }

    /// Expand size-1 axes to `shape`
    pub fn broadcast_to(&self, shape: Shape) -> LossResult<Tensor> {
        if self.shape.broadcast(&shape)? != shape {
            return Err(LossError::shape_error(&shape.to_string(), &self.shape.to_string(), None));
        }
        let mut data = Vec::with_capacity(shape.total_elements());
        for r in 0..shape.rows() {
            for c in 0..shape.cols() {
                data.push(self.broadcast_get(r, c));
            }
        }
        Ok(Tensor { shape, data, device: self.device })
    }

    /// Sum broadcast axes away so the result has `shape`; inverse of `broadcast_to`
    pub fn sum_to(&self, shape: Shape) -> LossResult<Tensor> {
        if shape == self.shape {
            return Ok(self.clone());
        }
        if shape.broadcast(&self.shape)? != self.shape {
            return Err(LossError::shape_error(&self.shape.to_string(), &shape.to_string(), None));
        }
        let mut out = Tensor::zeros(shape, self.device);
        for r in 0..self.rows() {
            for c in 0..self.cols() {
                let tr = if shape.rows() == 1 { 0 } else { r };
                let tc = if shape.cols() == 1 { 0 } else { c };
                out.data[tr * shape.cols() + tc] += self.get(r, c);
            }
        }
        Ok(out)
    }

    pub fn add(&self, other: &Tensor) -> LossResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> LossResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> LossResult<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> LossResult<Tensor> {
        self.zip_with(other, |a, b| a / b)
    }

    pub fn scale(&self, factor: f64) -> Tensor {
        self.map(|v| v * factor)
    }

    pub fn transpose(&self) -> Tensor {
        let (rows, cols) = (self.rows(), self.cols());
        let mut data = Vec::with_capacity(self.numel());
        for c in 0..cols {
            for r in 0..rows {
                data.push(self.get(r, c));
            }
        }
        Tensor {
            shape: Shape::new([cols, rows]),
            data,
            device: self.device,
        }
    }

    /// `self · other`
    pub fn matmul(&self, other: &Tensor) -> LossResult<Tensor> {
        self.device.ensure_same(other.device, "matmul")?;
        if self.cols() != other.rows() {
            return Err(LossError::shape_error(
                &format!("[{}, _] on the right of {}", self.cols(), self.shape),
                &other.shape.to_string(),
                None,
            ));
        }
        let (n, k, m) = (self.rows(), self.cols(), other.cols());
        let mut data = vec![0.0; n * m];
        for i in 0..n {
            for p in 0..k {
                let a = self.data[i * k + p];
                if a == 0.0 {
                    continue;
                }
                let row = &other.data[p * m..(p + 1) * m];
                for (out, &b) in data[i * m..(i + 1) * m].iter_mut().zip(row) {
                    *out += a * b;
                }
            }
        }
        Ok(Tensor {
            shape: Shape::new([n, m]),
            data,
            device: self.device,
        })
    }

    /// `self · otherᵀ`, the shape of a linear layer without bias
    pub fn matmul_transposed(&self, other: &Tensor) -> LossResult<Tensor> {
        self.device.ensure_same(other.device, "linear")?;
        if self.cols() != other.cols() {
            return Err(LossError::shape_error(
                &format!("[_, {}]", self.cols()),
                &other.shape.to_string(),
                Some("both operands need the same embedding dimension"),
            ));
        }
        let (n, d, m) = (self.rows(), self.cols(), other.rows());
        let mut data = Vec::with_capacity(n * m);
        for i in 0..n {
            let a = &self.data[i * d..(i + 1) * d];
            for j in 0..m {
                let b = &other.data[j * d..(j + 1) * d];
                data.push(a.iter().zip(b).map(|(x, y)| x * y).sum());
            }
        }
        Ok(Tensor {
            shape: Shape::new([n, m]),
            data,
            device: self.device,
        })
    }

    /// Sum along `axis`, keeping it as size 1
    pub fn sum_axis(&self, axis: usize) -> LossResult<Tensor> {
        match axis {
            0 => self.sum_to(Shape::new([1, self.cols()])),
            1 => self.sum_to(Shape::new([self.rows(), 1])),
            _ => Err(LossError::InvalidInput(format!("axis {} out of range for a 2-D tensor", axis))),
        }
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return f64::NAN;
        }
        self.sum() / self.data.len() as f64
    }
}
