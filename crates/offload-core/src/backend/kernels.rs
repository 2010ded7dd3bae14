//! Benchmark kernels shipped with the server.
//!
//! Each kernel is a plain Rust function over slices, usable as the local
//! body on the client, plus a table entry adapting it to `Value` arguments
//! for the server. Square matrices are passed flattened, with the element
//! count standing in for `N * N`.

use super::NativeFunctionTable;
use crate::error::{OffloadError, Result};
use crate::types::{Scalar, Value};

pub const ADD: &str = "5;32:add:5;32:5;32";
pub const SCALE: &str = "0:scale:9;2:5;32";
pub const MATMUL: &str = "0:matmul:9;8;2:5;32:9;8;2:5;32:9;8;2:5;32";
pub const JACOBI_2D: &str = "0:jacobi_2d:9;8;2:5;32";
pub const SEIDEL: &str = "0:seidel:9;8;2:5;32";

/// Time steps of the stencil kernels.
pub const STENCIL_STEPS: usize = 10;

/// Names of every built-in kernel, in table order.
pub const NAMES: [&str; 5] = ["add", "scale", "matmul", "jacobi_2d", "seidel"];

pub fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

/// Double every element in place.
pub fn scale(a: &mut [f64]) {
    for v in a {
        *v *= 2.0;
    }
}

/// Side length of a flattened square matrix.
pub fn square_side(elements: usize) -> Option<usize> {
    let n = (elements as f64).sqrt().round() as usize;
    (n * n == elements).then_some(n)
}

/// `c = a * b` for flattened `n x n` matrices.
pub fn matmul(a: &[f64], b: &[f64], c: &mut [f64], n: usize) {
    for i in 0..n {
        for j in 0..n {
            let mut sum = 0.0;
            for k in 0..n {
                sum += a[i * n + k] * b[k * n + j];
            }
            c[i * n + j] = sum;
        }
    }
}

/// Five-point Jacobi relaxation of the interior.
pub fn jacobi_2d(a: &mut [f64], n: usize, steps: usize) {
    if n < 3 {
        return;
    }
    let mut b = vec![0.0; n * n];
    for _ in 0..steps {
        for i in 1..n - 1 {
            for j in 1..n - 1 {
                b[i * n + j] = 0.2
                    * (a[i * n + j]
                        + a[i * n + j - 1]
                        + a[i * n + j + 1]
                        + a[(i + 1) * n + j]
                        + a[(i - 1) * n + j]);
            }
        }
        for i in 1..n - 1 {
            a[i * n + 1..i * n + n - 1].copy_from_slice(&b[i * n + 1..i * n + n - 1]);
        }
    }
}

/// Nine-point Gauss-Seidel sweep of the interior, in place.
pub fn seidel(a: &mut [f64], n: usize, steps: usize) {
    if n < 3 {
        return;
    }
    for _ in 0..steps {
        for i in 1..n - 1 {
            for j in 1..n - 1 {
                let mut sum = 0.0;
                for di in [i - 1, i, i + 1] {
                    for dj in [j - 1, j, j + 1] {
                        sum += a[di * n + dj];
                    }
                }
                a[i * n + j] = sum / 9.0;
            }
        }
    }
}

/// Deterministic stencil input, `(i * (j + 2) + 2) / n`.
pub fn stencil_input(n: usize) -> Vec<f64> {
    let mut a = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            a[i * n + j] = (i as f64 * (j as f64 + 2.0) + 2.0) / n as f64;
        }
    }
    a
}

fn kernel_error(function: &str, message: impl Into<String>) -> OffloadError {
    OffloadError::Backend {
        function: function.to_string(),
        message: message.into(),
    }
}

fn doubles<'a>(function: &str, args: &'a mut [Value], index: usize) -> Result<&'a mut [f64]> {
    args.get_mut(index)
        .and_then(Value::array_mut)
        .and_then(|a| a.as_f64_mut())
        .ok_or_else(|| kernel_error(function, format!("argument {} is not a double array", index)))
}

/// Side length of the square matrix at `index`, from the count after it.
fn side(function: &str, args: &[Value], index: usize) -> Result<usize> {
    let count = args
        .get(index + 1)
        .and_then(Value::as_i64)
        .and_then(|c| usize::try_from(c).ok())
        .ok_or_else(|| kernel_error(function, format!("argument {} is not a count", index + 1)))?;
    let n = square_side(count)
        .ok_or_else(|| kernel_error(function, format!("{} is not a square", count)))?;
    match args.get(index) {
        Some(Value::Array(a)) if a.len() >= count => Ok(n),
        _ => Err(kernel_error(
            function,
            format!("argument {} holds fewer than {} elements", index, count),
        )),
    }
}

/// Table with every built-in kernel registered.
pub fn builtin_table() -> Result<NativeFunctionTable> {
    NativeFunctionTable::new()
        .with(ADD, |args| {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0) as i32;
            let b = args.get(1).and_then(Value::as_i64).unwrap_or(0) as i32;
            Ok(Value::Scalar(Scalar::i32(add(a, b))))
        })?
        .with(SCALE, |args| {
            scale(doubles("scale", args, 0)?);
            Ok(Value::Void)
        })?
        .with(MATMUL, |args| {
            let n = side("matmul", args, 0)?;
            if side("matmul", args, 2)? != n || side("matmul", args, 4)? != n {
                return Err(kernel_error("matmul", "matrices differ in size"));
            }
            let a = doubles("matmul", args, 0)?.to_vec();
            let b = doubles("matmul", args, 2)?.to_vec();
            let c = doubles("matmul", args, 4)?;
            matmul(&a, &b, c, n);
            Ok(Value::Void)
        })?
        .with(JACOBI_2D, |args| {
            let n = side("jacobi_2d", args, 0)?;
            jacobi_2d(doubles("jacobi_2d", args, 0)?, n, STENCIL_STEPS);
            Ok(Value::Void)
        })?
        .with(SEIDEL, |args| {
            let n = side("seidel", args, 0)?;
            seidel(doubles("seidel", args, 0)?, n, STENCIL_STEPS);
            Ok(Value::Void)
        })
}
