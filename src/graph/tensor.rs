use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use super::GraphError;

/// Handle to a node of the computation graph: a row-major `rows x cols`
/// matrix of `f64` together with its gradient and the op that produced it.
#[derive(Clone, Debug)]
pub struct Tensor(Rc<RefCell<Node>>);

#[derive(Debug)]
struct Node {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
    grad: Vec<f64>,
    op: Op,
    prev: Vec<Tensor>,
}

#[derive(Clone, Debug)]
enum Op {
    Leaf,
    Add,
    AddRow,
    Sub,
    Mul,
    Scale(f64),
    MatMul,
    Transpose,
    Tanh,
    Relu,
    Sigmoid,
    Pow(f64),
    Sum,
    RowSums,
    RowNorms,
    ConcatCols,
    ConcatRows,
    Gather(Vec<usize>),
    LogSoftmaxRows,
    Pick(Vec<usize>),
}

impl Tensor {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, GraphError> {
        if data.len() != rows * cols {
            return Err(GraphError::Shape {
                rows,
                cols,
                len: data.len(),
            });
        }
        Ok(Self::from_parts(rows, cols, data, Op::Leaf, Vec::new()))
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::from_parts(rows, cols, vec![0.0; rows * cols], Op::Leaf, Vec::new())
    }

    pub fn scalar(value: f64) -> Self {
        Self::from_parts(1, 1, vec![value], Op::Leaf, Vec::new())
    }

    /// Leaf filled with `value`. Never handed to an optimizer.
    pub fn constant(rows: usize, cols: usize, value: f64) -> Self {
        Self::from_parts(rows, cols, vec![value; rows * cols], Op::Leaf, Vec::new())
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                data.push(f(i, j));
            }
        }
        Self::from_parts(rows, cols, data, Op::Leaf, Vec::new())
    }

    fn from_parts(rows: usize, cols: usize, data: Vec<f64>, op: Op, prev: Vec<Tensor>) -> Self {
        Self(Rc::new(RefCell::new(Node {
            rows,
            cols,
            grad: vec![0.0; data.len()],
            data,
            op,
            prev,
        })))
    }

    pub fn shape(&self) -> (usize, usize) {
        let node = self.0.borrow();
        (node.rows, node.cols)
    }

    pub fn rows(&self) -> usize {
        self.0.borrow().rows
    }

    pub fn cols(&self) -> usize {
        self.0.borrow().cols
    }

    pub fn data(&self) -> Vec<f64> {
        self.0.borrow().data.clone()
    }

    pub fn grad(&self) -> Vec<f64> {
        self.0.borrow().grad.clone()
    }

    /// Value of a 1x1 tensor (or the first element of any tensor).
    pub fn item(&self) -> f64 {
        self.0.borrow().data.first().copied().unwrap_or(0.0)
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        let node = self.0.borrow();
        node.data[row * node.cols + col]
    }

    pub fn set_data(&self, data: Vec<f64>) -> Result<(), GraphError> {
        let mut node = self.0.borrow_mut();
        if data.len() != node.data.len() {
            return Err(GraphError::Shape {
                rows: node.rows,
                cols: node.cols,
                len: data.len(),
            });
        }
        node.data = data;
        Ok(())
    }

    pub(crate) fn with_data_mut<F: FnOnce(&mut [f64])>(&self, f: F) {
        f(&mut self.0.borrow_mut().data);
    }

    pub(crate) fn with_data_and_grad<R, F: FnOnce(&mut [f64], &[f64]) -> R>(&self, f: F) -> R {
        let mut node = self.0.borrow_mut();
        let Node { data, grad, .. } = &mut *node;
        f(data, grad)
    }

    pub fn zero_grad(&self) {
        self.0.borrow_mut().grad.fill(0.0);
    }

    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn add(&self, other: &Tensor) -> Tensor {
        let (rows, cols) = self.shape();
        assert_eq!(other.shape(), (rows, cols), "add expects matching shapes");
        let data = zip_data(self, other, |a, b| a + b);
        Self::from_parts(rows, cols, data, Op::Add, vec![self.clone(), other.clone()])
    }

    /// Adds a `1 x cols` row vector to every row.
    pub fn add_row(&self, row: &Tensor) -> Tensor {
        let (rows, cols) = self.shape();
        assert_eq!(row.shape(), (1, cols), "add_row expects a 1 x cols bias");
        let bias = row.data();
        let mut data = self.data();
        for (idx, value) in data.iter_mut().enumerate() {
            *value += bias[idx % cols];
        }
        Self::from_parts(rows, cols, data, Op::AddRow, vec![self.clone(), row.clone()])
    }

    pub fn sub(&self, other: &Tensor) -> Tensor {
        let (rows, cols) = self.shape();
        assert_eq!(other.shape(), (rows, cols), "sub expects matching shapes");
        let data = zip_data(self, other, |a, b| a - b);
        Self::from_parts(rows, cols, data, Op::Sub, vec![self.clone(), other.clone()])
    }

    pub fn mul(&self, other: &Tensor) -> Tensor {
        let (rows, cols) = self.shape();
        assert_eq!(other.shape(), (rows, cols), "mul expects matching shapes");
        let data = zip_data(self, other, |a, b| a * b);
        Self::from_parts(rows, cols, data, Op::Mul, vec![self.clone(), other.clone()])
    }

    pub fn scale(&self, factor: f64) -> Tensor {
        let (rows, cols) = self.shape();
        let data = self.data().into_iter().map(|x| x * factor).collect();
        Self::from_parts(rows, cols, data, Op::Scale(factor), vec![self.clone()])
    }

    pub fn matmul(&self, other: &Tensor) -> Tensor {
        let (rows, inner) = self.shape();
        let (other_rows, cols) = other.shape();
        assert_eq!(inner, other_rows, "matmul expects lhs.cols == rhs.rows");
        let lhs = self.data();
        let rhs = other.data();
        let mut data = vec![0.0; rows * cols];
        for i in 0..rows {
            for p in 0..inner {
                let a = lhs[i * inner + p];
                if a == 0.0 {
                    continue;
                }
                let out = &mut data[i * cols..(i + 1) * cols];
                let rhs_row = &rhs[p * cols..(p + 1) * cols];
                for (o, b) in out.iter_mut().zip(rhs_row) {
                    *o += a * b;
                }
            }
        }
        Self::from_parts(rows, cols, data, Op::MatMul, vec![self.clone(), other.clone()])
    }

    pub fn transpose(&self) -> Tensor {
        let (rows, cols) = self.shape();
        let src = self.data();
        let mut data = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                data[j * rows + i] = src[i * cols + j];
            }
        }
        Self::from_parts(cols, rows, data, Op::Transpose, vec![self.clone()])
    }

    pub fn tanh(&self) -> Tensor {
        self.map(Op::Tanh, f64::tanh)
    }

    pub fn relu(&self) -> Tensor {
        self.map(Op::Relu, |x| x.max(0.0))
    }

    pub fn sigmoid(&self) -> Tensor {
        self.map(Op::Sigmoid, |x| 1.0 / (1.0 + (-x).exp()))
    }

    pub fn powf(&self, exponent: f64) -> Tensor {
        self.map(Op::Pow(exponent), |x| x.powf(exponent))
    }

    pub fn sum(&self) -> Tensor {
        let total = self.0.borrow().data.iter().sum();
        Self::from_parts(1, 1, vec![total], Op::Sum, vec![self.clone()])
    }

    pub fn mean(&self) -> Tensor {
        let count = self.0.borrow().data.len().max(1);
        self.sum().scale(1.0 / count as f64)
    }

    /// `rows x 1` tensor of per-row sums.
    pub fn row_sums(&self) -> Tensor {
        let (rows, cols) = self.shape();
        let src = self.data();
        let data = (0..rows)
            .map(|i| src[i * cols..(i + 1) * cols].iter().sum())
            .collect();
        Self::from_parts(rows, 1, data, Op::RowSums, vec![self.clone()])
    }

    /// `rows x 1` tensor of per-row L2 norms. A zero row passes no gradient.
    pub fn row_norms(&self) -> Tensor {
        let (rows, cols) = self.shape();
        let src = self.data();
        let data = (0..rows)
            .map(|i| {
                src[i * cols..(i + 1) * cols]
                    .iter()
                    .map(|x| x * x)
                    .sum::<f64>()
                    .sqrt()
            })
            .collect();
        Self::from_parts(rows, 1, data, Op::RowNorms, vec![self.clone()])
    }

    /// `sum(x^2) / 2`.
    pub fn l2_loss(&self) -> Tensor {
        self.mul(self).sum().scale(0.5)
    }

    pub fn concat_cols(parts: &[Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "concat_cols expects at least one tensor");
        let rows = parts[0].rows();
        assert!(
            parts.iter().all(|part| part.rows() == rows),
            "concat_cols expects matching row counts"
        );
        let cols: usize = parts.iter().map(Tensor::cols).sum();
        let mut data = Vec::with_capacity(rows * cols);
        let sources: Vec<(Vec<f64>, usize)> =
            parts.iter().map(|part| (part.data(), part.cols())).collect();
        for i in 0..rows {
            for (src, width) in &sources {
                data.extend_from_slice(&src[i * width..(i + 1) * width]);
            }
        }
        Self::from_parts(rows, cols, data, Op::ConcatCols, parts.to_vec())
    }

    pub fn concat_rows(parts: &[Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "concat_rows expects at least one tensor");
        let cols = parts[0].cols();
        assert!(
            parts.iter().all(|part| part.cols() == cols),
            "concat_rows expects matching column counts"
        );
        let mut data = Vec::new();
        let mut rows = 0;
        for part in parts {
            rows += part.rows();
            data.extend(part.data());
        }
        Self::from_parts(rows, cols, data, Op::ConcatRows, parts.to_vec())
    }

    /// Gathers rows by index (embedding lookup); backward scatters-adds.
    pub fn gather(&self, indices: &[usize]) -> Tensor {
        let (rows, cols) = self.shape();
        let src = self.0.borrow();
        let mut data = Vec::with_capacity(indices.len() * cols);
        for &idx in indices {
            assert!(idx < rows, "gather index {idx} out of range for {rows} rows");
            data.extend_from_slice(&src.data[idx * cols..(idx + 1) * cols]);
        }
        drop(src);
        Self::from_parts(
            indices.len(),
            cols,
            data,
            Op::Gather(indices.to_vec()),
            vec![self.clone()],
        )
    }

    pub fn log_softmax_rows(&self) -> Tensor {
        let (rows, cols) = self.shape();
        let mut data = self.data();
        for row in data.chunks_mut(cols.max(1)).take(rows) {
            // Subtract the row max before exponentiating.
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let log_sum = row.iter().map(|x| (x - max).exp()).sum::<f64>().ln() + max;
            for value in row.iter_mut() {
                *value -= log_sum;
            }
        }
        Self::from_parts(rows, cols, data, Op::LogSoftmaxRows, vec![self.clone()])
    }

    /// Picks one column per row, producing `rows x 1`.
    pub fn pick(&self, columns: &[usize]) -> Tensor {
        let (rows, cols) = self.shape();
        assert_eq!(columns.len(), rows, "pick expects one column per row");
        let src = self.0.borrow();
        let data = columns
            .iter()
            .enumerate()
            .map(|(i, &j)| {
                assert!(j < cols, "pick column {j} out of range for {cols} columns");
                src.data[i * cols + j]
            })
            .collect();
        drop(src);
        Self::from_parts(rows, 1, data, Op::Pick(columns.to_vec()), vec![self.clone()])
    }

    fn map(&self, op: Op, f: impl Fn(f64) -> f64) -> Tensor {
        let (rows, cols) = self.shape();
        let data = self.0.borrow().data.iter().map(|x| f(*x)).collect();
        Self::from_parts(rows, cols, data, op, vec![self.clone()])
    }

    pub fn backward(&self) {
        let topo = self.topo_order();

        for node in &topo {
            node.0.borrow_mut().grad.fill(0.0);
        }
        self.0.borrow_mut().grad.fill(1.0);

        for node in topo.into_iter().rev() {
            node.propagate();
        }
    }

    // Iterative post-order DFS: recurrent graphs get deep enough to blow the
    // stack with recursion.
    fn topo_order(&self) -> Vec<Tensor> {
        let mut topo = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                topo.push(node);
                continue;
            }
            if !visited.insert(node.id()) {
                continue;
            }
            stack.push((node.clone(), true));
            for child in node.0.borrow().prev.iter() {
                if !visited.contains(&child.id()) {
                    stack.push((child.clone(), false));
                }
            }
        }
        topo
    }

    fn propagate(&self) {
        let deltas = {
            let node = self.0.borrow();
            if node.grad.iter().all(|g| *g == 0.0) {
                return;
            }
            node.input_deltas()
        };
        let prev = self.0.borrow().prev.clone();
        for (idx, delta) in deltas {
            add_grad(&prev[idx], &delta);
        }
    }
}

impl Node {
    fn input_deltas(&self) -> Vec<(usize, Vec<f64>)> {
        let grad = &self.grad;
        match &self.op {
            Op::Leaf => Vec::new(),
            Op::Add => vec![(0, grad.clone()), (1, grad.clone())],
            Op::AddRow => {
                let mut bias = vec![0.0; self.cols];
                for (idx, g) in grad.iter().enumerate() {
                    bias[idx % self.cols] += g;
                }
                vec![(0, grad.clone()), (1, bias)]
            }
            Op::Sub => vec![(0, grad.clone()), (1, grad.iter().map(|g| -g).collect())],
            Op::Mul => {
                let lhs = self.prev[0].data();
                let rhs = self.prev[1].data();
                let d_lhs = grad.iter().zip(&rhs).map(|(g, b)| g * b).collect();
                let d_rhs = grad.iter().zip(&lhs).map(|(g, a)| g * a).collect();
                vec![(0, d_lhs), (1, d_rhs)]
            }
            Op::Scale(factor) => vec![(0, grad.iter().map(|g| g * factor).collect())],
            Op::MatMul => {
                let (rows, inner) = self.prev[0].shape();
                let cols = self.cols;
                let lhs = self.prev[0].data();
                let rhs = self.prev[1].data();
                let mut d_lhs = vec![0.0; rows * inner];
                let mut d_rhs = vec![0.0; inner * cols];
                for i in 0..rows {
                    let g_row = &grad[i * cols..(i + 1) * cols];
                    for p in 0..inner {
                        let rhs_row = &rhs[p * cols..(p + 1) * cols];
                        d_lhs[i * inner + p] =
                            g_row.iter().zip(rhs_row).map(|(g, b)| g * b).sum();
                        let a = lhs[i * inner + p];
                        if a != 0.0 {
                            let d_row = &mut d_rhs[p * cols..(p + 1) * cols];
                            for (d, g) in d_row.iter_mut().zip(g_row) {
                                *d += a * g;
                            }
                        }
                    }
                }
                vec![(0, d_lhs), (1, d_rhs)]
            }
            Op::Transpose => {
                // self is cols x rows of the input
                let (in_rows, in_cols) = self.prev[0].shape();
                let mut delta = vec![0.0; in_rows * in_cols];
                for i in 0..in_rows {
                    for j in 0..in_cols {
                        delta[i * in_cols + j] = grad[j * in_rows + i];
                    }
                }
                vec![(0, delta)]
            }
            Op::Tanh => vec![(
                0,
                grad.iter()
                    .zip(&self.data)
                    .map(|(g, y)| g * (1.0 - y * y))
                    .collect(),
            )],
            Op::Relu => {
                let input = self.prev[0].data();
                vec![(
                    0,
                    grad.iter()
                        .zip(&input)
                        .map(|(g, x)| if *x > 0.0 { *g } else { 0.0 })
                        .collect(),
                )]
            }
            Op::Sigmoid => vec![(
                0,
                grad.iter()
                    .zip(&self.data)
                    .map(|(g, y)| g * y * (1.0 - y))
                    .collect(),
            )],
            Op::Pow(exponent) => {
                let input = self.prev[0].data();
                vec![(
                    0,
                    grad.iter()
                        .zip(&input)
                        .map(|(g, x)| exponent * x.powf(exponent - 1.0) * g)
                        .collect(),
                )]
            }
            Op::Sum => {
                let len = self.prev[0].0.borrow().data.len();
                vec![(0, vec![grad[0]; len])]
            }
            Op::RowNorms => {
                let input = self.prev[0].data();
                let in_cols = self.prev[0].cols();
                let mut delta = vec![0.0; input.len()];
                for (i, (g, norm)) in grad.iter().zip(&self.data).enumerate() {
                    if *norm == 0.0 {
                        continue;
                    }
                    for j in 0..in_cols {
                        delta[i * in_cols + j] = g * input[i * in_cols + j] / norm;
                    }
                }
                vec![(0, delta)]
            }
            Op::RowSums => {
                let in_cols = self.prev[0].cols();
                let delta = grad
                    .iter()
                    .flat_map(|g| std::iter::repeat_n(*g, in_cols))
                    .collect();
                vec![(0, delta)]
            }
            Op::ConcatCols => {
                let mut deltas = Vec::with_capacity(self.prev.len());
                let mut offset = 0;
                for (idx, part) in self.prev.iter().enumerate() {
                    let width = part.cols();
                    let mut delta = Vec::with_capacity(self.rows * width);
                    for i in 0..self.rows {
                        let start = i * self.cols + offset;
                        delta.extend_from_slice(&grad[start..start + width]);
                    }
                    deltas.push((idx, delta));
                    offset += width;
                }
                deltas
            }
            Op::ConcatRows => {
                let mut deltas = Vec::with_capacity(self.prev.len());
                let mut offset = 0;
                for (idx, part) in self.prev.iter().enumerate() {
                    let len = part.rows() * self.cols;
                    deltas.push((idx, grad[offset..offset + len].to_vec()));
                    offset += len;
                }
                deltas
            }
            Op::Gather(indices) => {
                let (in_rows, cols) = self.prev[0].shape();
                let mut delta = vec![0.0; in_rows * cols];
                for (k, &idx) in indices.iter().enumerate() {
                    let src = &grad[k * cols..(k + 1) * cols];
                    for (d, g) in delta[idx * cols..(idx + 1) * cols].iter_mut().zip(src) {
                        *d += g;
                    }
                }
                vec![(0, delta)]
            }
            Op::LogSoftmaxRows => {
                let cols = self.cols;
                let mut delta = vec![0.0; grad.len()];
                for i in 0..self.rows {
                    let g_row = &grad[i * cols..(i + 1) * cols];
                    let y_row = &self.data[i * cols..(i + 1) * cols];
                    let g_sum: f64 = g_row.iter().sum();
                    for j in 0..cols {
                        delta[i * cols + j] = g_row[j] - y_row[j].exp() * g_sum;
                    }
                }
                vec![(0, delta)]
            }
            Op::Pick(columns) => {
                let in_cols = self.prev[0].cols();
                let mut delta = vec![0.0; self.rows * in_cols];
                for (i, &j) in columns.iter().enumerate() {
                    delta[i * in_cols + j] = grad[i];
                }
                vec![(0, delta)]
            }
        }
    }
}

fn zip_data(lhs: &Tensor, rhs: &Tensor, f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    let a = lhs.0.borrow();
    if Rc::ptr_eq(&lhs.0, &rhs.0) {
        return a.data.iter().map(|x| f(*x, *x)).collect();
    }
    let b = rhs.0.borrow();
    a.data.iter().zip(&b.data).map(|(x, y)| f(*x, *y)).collect()
}

fn add_grad(tensor: &Tensor, delta: &[f64]) {
    let mut node = tensor.0.borrow_mut();
    for (g, d) in node.grad.iter_mut().zip(delta) {
        *g += d;
    }
}
