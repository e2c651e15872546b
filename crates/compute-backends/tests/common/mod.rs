//! Kernels shared by the backend integration tests

#![allow(dead_code)]

use std::sync::Once;

use compute_backends::{register_host_kernel, register_stream_kernel};
use compute_kernel::{describe_struct, register_type_of, ComputeContext, ConstSpan, GridRange, Kernel, MutSpan, Result};

/// Layout the caller passes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Affine {
    pub scale: u32,
    pub offset: u32,
}

describe_struct!(Affine { scale: u32, offset: u32 });

/// Same fields in the order the kernel declares them
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelAffine {
    pub offset: u64,
    pub scale: u64,
}

describe_struct!(KernelAffine { offset: u64, scale: u64 });

/// Zero-dimensional: writes `input + 1` into a one-element output cell.
fn add_one(_ctx: &dyn ComputeContext) -> Result<Kernel> {
    let mut kernel = Kernel::new("addOne");
    kernel
        .add_parameter("input", "r", "u32")?
        .add_parameter("output", "rw", "u32[1]")?;
    kernel.set_compute_function(|_ctx, (input, output): &mut (u32, MutSpan<u32>)| {
        output.as_mut_slice()[0] = *input + 1;
    })?;
    Ok(kernel)
}

fn increment_each(_ctx: &dyn ComputeContext) -> Result<Kernel> {
    let mut kernel = Kernel::new("incrementEach");
    kernel
        .add_parameter("output", "rw", "u32[n]")?
        .add_parameter("input", "r", "u32[n]")?
        .add_parameter("n", "r", "u32")?
        .add_dimension("i", "n")?;
    kernel.set_compute_function_1d(
        |_ctx, i, n, (output, input, _): &mut (MutSpan<u32>, ConstSpan<u32>, u32)| {
            if i < n {
                output.as_mut_slice()[i as usize] = input.as_slice()[i as usize] + 1;
            }
        },
    )?;
    Ok(kernel)
}

/// Appends each visited index to `order`; `state` holds the cursor and the
/// extent seen by the last call.
fn record_order(_ctx: &dyn ComputeContext) -> Result<Kernel> {
    let mut kernel = Kernel::new("recordOrder");
    kernel
        .add_parameter("order", "rw", "u32[]")?
        .add_parameter("state", "rw", "u32[=2]")?;
    kernel.set_compute_function_1d(|_ctx, i, n, (order, state): &mut (MutSpan<u32>, MutSpan<u32>)| {
        let state = state.as_mut_slice();
        order.as_mut_slice()[state[0] as usize] = i;
        state[0] += 1;
        state[1] = n;
    })?;
    Ok(kernel)
}

fn count_calls(_ctx: &dyn ComputeContext) -> Result<Kernel> {
    let mut kernel = Kernel::new("countCalls");
    kernel.add_parameter("counter", "rw", "u32[1]")?;
    kernel.set_compute_function(|_ctx, (counter,): &mut (MutSpan<u32>,)| {
        counter.as_mut_slice()[0] += 1;
    })?;
    Ok(kernel)
}

fn apply_affine(_ctx: &dyn ComputeContext) -> Result<Kernel> {
    let mut kernel = Kernel::new("applyAffine");
    kernel
        .add_parameter("data", "rw", "u64[]")?
        .add_parameter("transform", "r", "KernelAffine")?;
    kernel.set_compute_function_1d_range(|_ctx, range: &GridRange, (data, t): &mut (MutSpan<u64>, KernelAffine)| {
        for i in range.indices() {
            let value = &mut data.as_mut_slice()[i as usize];
            *value = *value * t.scale + t.offset;
        }
    })?;
    Ok(kernel)
}

/// Writes `row * cols + col` into a row-major matrix; the row dimension is
/// padded to blocks of four.
fn fill_matrix(_ctx: &dyn ComputeContext) -> Result<Kernel> {
    let mut kernel = Kernel::new("fillMatrix");
    kernel
        .add_parameter("out", "rw", "u32[rows * cols]")?
        .add_parameter("rows", "r", "u32")?
        .add_parameter("cols", "r", "u32")?
        .add_padded_dimension("row", "rows", 4)?
        .add_dimension("col", "cols")?;
    kernel.allow_grid_padding();
    kernel.set_compute_function_2d(
        |_ctx, row, rows, col, _cols, (out, _, cols): &mut (MutSpan<u32>, u32, u32)| {
            if row >= rows {
                return;
            }
            out.as_mut_slice()[(row * *cols + col) as usize] = row * *cols + col;
        },
    )?;
    Ok(kernel)
}

fn panics(_ctx: &dyn ComputeContext) -> Result<Kernel> {
    let mut kernel = Kernel::new("panics");
    kernel.add_parameter("n", "r", "u32")?;
    kernel.set_compute_function_1d(|_ctx, i, _n, _args: &mut (u32,)| {
        if i == 1 {
            panic!("index one is cursed");
        }
    })?;
    Ok(kernel)
}

/// Register every test kernel with the host and stream backends once per
/// test binary.
pub fn register_kernels() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        compute_tracing::init_test_tracing();
        register_type_of::<KernelAffine>().expect("register KernelAffine");
        let kernels: [(&str, fn(&dyn ComputeContext) -> Result<Kernel>); 7] = [
            ("addOne", add_one),
            ("incrementEach", increment_each),
            ("recordOrder", record_order),
            ("countCalls", count_calls),
            ("applyAffine", apply_affine),
            ("fillMatrix", fill_matrix),
            ("panics", panics),
        ];
        for (name, factory) in kernels {
            register_host_kernel(name, factory).expect("register host kernel");
            register_stream_kernel(name, factory).expect("register stream kernel");
        }
    });
}
