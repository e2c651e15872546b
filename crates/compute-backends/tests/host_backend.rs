//! Binding and launching through the synchronous host backend

mod common;

use common::{register_kernels, Affine};
use compute_backends::HostContext;
use compute_kernel::{Argument, ComputeContext, ErrorKind, GridRange};

fn context() -> HostContext {
    register_kernels();
    HostContext::new()
}

#[test]
fn test_add_one() {
    let ctx = context();
    let output = ctx.allocate_array::<u32>("output", 1).unwrap();

    let kernel = ctx.kernel("addOne").unwrap();
    let bound = kernel
        .bind(&ctx, &[Argument::value(41u32), Argument::region(&output)])
        .unwrap();
    assert_eq!(bound.grid_arity(), 0);

    let queue = ctx.queue("main").unwrap();
    let event = queue.launch("addOne", &bound, &[], &[]).unwrap();
    event.wait().unwrap();
    assert_eq!(output.to_vec::<u32>().unwrap(), vec![42]);
}

#[test]
fn test_increment_each() {
    let ctx = context();
    let input = ctx.allocate_array::<u32>("input", 3).unwrap();
    let output = ctx.allocate_array::<u32>("output", 3).unwrap();
    input.write(0, &[41u32, 0, 9]).unwrap();

    let bound = ctx
        .kernel("incrementEach")
        .unwrap()
        .bind(
            &ctx,
            &[Argument::region(&output), Argument::const_region(&input), Argument::value(3u32)],
        )
        .unwrap();
    let queue = ctx.queue("main").unwrap();
    queue.launch_default("incrementEach", &bound, &[]).unwrap().wait().unwrap();

    assert_eq!(output.to_vec::<u32>().unwrap(), vec![42, 1, 10]);
    assert_eq!(input.to_vec::<u32>().unwrap(), vec![41, 0, 9]);
}

#[test]
fn test_kernel_is_cached_per_context() {
    let ctx = context();
    let first = ctx.kernel("addOne").unwrap();
    let second = ctx.kernel("addOne").unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    let other = HostContext::new();
    assert!(!std::sync::Arc::ptr_eq(&first, &other.kernel("addOne").unwrap()));
}

#[test]
fn test_unregistered_kernel() {
    let ctx = context();
    let err = ctx.kernel("doesNotExist").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnregisteredKernel);
    assert!(err.to_string().contains("doesNotExist"));
}

#[test]
fn test_too_few_arguments() {
    let ctx = context();
    let kernel = ctx.kernel("addOne").unwrap();
    let err = kernel.bind(&ctx, &[Argument::value(41u32)]).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Arity);
    let message = err.to_string();
    assert!(message.contains("addOne"), "{message}");
    assert!(message.contains("not enough parameters"), "{message}");
}

#[test]
fn test_read_only_region_for_output() {
    let ctx = context();
    let output = ctx.allocate_array::<u32>("output", 1).unwrap();
    let kernel = ctx.kernel("addOne").unwrap();
    let err = kernel
        .bind(&ctx, &[Argument::value(41u32), Argument::const_region(&output)])
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CapabilityMismatch);
    assert!(err.to_string().contains("output"), "{err}");
}

#[test]
fn test_short_array_is_rejected() {
    let ctx = context();
    let input = ctx.allocate_array::<u32>("input", 4).unwrap();
    let output = ctx.allocate_array::<u32>("output", 2).unwrap();
    let kernel = ctx.kernel("incrementEach").unwrap();
    let err = kernel
        .bind(
            &ctx,
            &[Argument::region(&output), Argument::const_region(&input), Argument::value(4u32)],
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeConversion);
}

#[test]
fn test_indices_visited_in_order() {
    let ctx = context();
    let order = ctx.allocate_array::<u32>("order", 6).unwrap();
    let state = ctx.allocate_array::<u32>("state", 2).unwrap();
    let kernel = ctx.kernel("recordOrder").unwrap();
    let bound = kernel
        .bind(&ctx, &[Argument::region(&order), Argument::region(&state)])
        .unwrap();

    let queue = ctx.queue("main").unwrap();
    queue.launch("recordOrder", &bound, &[6], &[]).unwrap();
    assert_eq!(order.to_vec::<u32>().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(state.to_vec::<u32>().unwrap(), vec![6, 6]);
}

#[test]
fn test_explicit_range_with_offset() {
    let ctx = context();
    let order = ctx.allocate_array::<u32>("order", 3).unwrap();
    let state = ctx.allocate_array::<u32>("state", 2).unwrap();
    let kernel = ctx.kernel("recordOrder").unwrap();
    let bound = kernel
        .bind(&ctx, &[Argument::region(&order), Argument::region(&state)])
        .unwrap();

    let queue = ctx.queue("main").unwrap();
    queue
        .launch_ranges("recordOrder", &bound, &[GridRange::new(10, 3)], &[])
        .unwrap();
    assert_eq!(order.to_vec::<u32>().unwrap(), vec![10, 11, 12]);
}

#[test]
fn test_zero_dimensional_runs_once() {
    let ctx = context();
    let counter = ctx.allocate_array::<u32>("counter", 1).unwrap();
    let kernel = ctx.kernel("countCalls").unwrap();
    let bound = kernel.bind(&ctx, &[Argument::region(&counter)]).unwrap();
    assert_eq!(bound.grid_arity(), 0);

    let queue = ctx.queue("main").unwrap();
    queue.launch("countCalls", &bound, &[], &[]).unwrap();
    assert_eq!(counter.to_vec::<u32>().unwrap(), vec![1]);

    let err = queue.launch("countCalls", &bound, &[4], &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GridDimensions);
    assert_eq!(counter.to_vec::<u32>().unwrap(), vec![1]);
}

#[test]
fn test_empty_grid_does_nothing() {
    let ctx = context();
    let order = ctx.allocate_array::<u32>("order", 1).unwrap();
    let state = ctx.allocate_array::<u32>("state", 2).unwrap();
    let kernel = ctx.kernel("recordOrder").unwrap();
    let bound = kernel
        .bind(&ctx, &[Argument::region(&order), Argument::region(&state)])
        .unwrap();
    let queue = ctx.queue("main").unwrap();
    let event = queue.launch("recordOrder", &bound, &[0], &[]).unwrap();
    assert!(event.is_resolved());
    assert_eq!(state.to_vec::<u32>().unwrap(), vec![0, 0]);
}

#[test]
fn test_struct_argument_converted_by_field_name() {
    let ctx = context();
    let data = ctx.allocate_array::<u64>("data", 3).unwrap();
    data.write(0, &[1u64, 2, 3]).unwrap();
    let kernel = ctx.kernel("applyAffine").unwrap();
    let bound = kernel
        .bind(
            &ctx,
            &[Argument::region(&data), Argument::value(Affine { scale: 10, offset: 5 })],
        )
        .unwrap();
    ctx.queue("main").unwrap().launch("applyAffine", &bound, &[3], &[]).unwrap();
    assert_eq!(data.to_vec::<u64>().unwrap(), vec![15, 25, 35]);
}

#[test]
fn test_scalar_where_array_expected() {
    let ctx = context();
    let kernel = ctx.kernel("applyAffine").unwrap();
    let err = kernel
        .bind(
            &ctx,
            &[Argument::value(3u64), Argument::value(Affine { scale: 1, offset: 0 })],
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapabilityMismatch);
    assert!(err.to_string().contains("parameter 0 ('data')"), "{err}");
}

#[test]
fn test_padded_default_grid() {
    let ctx = context();
    let out = ctx.allocate_array::<u32>("out", 6).unwrap();
    let kernel = ctx.kernel("fillMatrix").unwrap();
    let bound = kernel
        .bind(&ctx, &[Argument::region(&out), Argument::value(3u32), Argument::value(2u32)])
        .unwrap();

    assert_eq!(bound.default_grid(), Some(&[3u32, 2][..]));
    let grid = bound.grid_for(&[3, 2]).unwrap();
    assert_eq!(grid[0].padded_extent(), 4);
    assert_eq!(grid[1].padded_extent(), 2);

    ctx.queue("main").unwrap().launch_default("fillMatrix", &bound, &[]).unwrap();
    assert_eq!(out.to_vec::<u32>().unwrap(), vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn test_fill_and_copy() {
    let ctx = context();
    let a = ctx.allocate_array::<u16>("a", 4).unwrap();
    let b = ctx.allocate_array::<u16>("b", 4).unwrap();
    let queue = ctx.queue("main").unwrap();

    let filled = queue
        .enqueue_fill("fill", &a, &0x0102u16.to_ne_bytes(), 2, 4, &[])
        .unwrap();
    let copied = queue.enqueue_copy("copy", &a, &b, &[filled]).unwrap();
    copied.wait().unwrap();
    assert_eq!(b.to_vec::<u16>().unwrap(), vec![0, 0x0102, 0x0102, 0]);
}

#[test]
fn test_foreign_region_is_rejected() {
    let ctx = context();
    let other = HostContext::new();
    let region = other.allocate_array::<u32>("elsewhere", 1).unwrap();

    let queue = ctx.queue("main").unwrap();
    let err = queue.enqueue_fill("fill", &region, &[0], 0, 4, &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ForeignContext);

    let local = ctx.allocate_array::<u32>("local", 1).unwrap();
    let err = queue.enqueue_copy("copy", &local, &region, &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ForeignContext);
}

#[test]
fn test_foreign_bound_kernel_is_rejected() {
    let ctx = context();
    let other = HostContext::new();
    let counter = other.allocate_array::<u32>("counter", 1).unwrap();
    let bound = other
        .kernel("countCalls")
        .unwrap()
        .bind(&other, &[Argument::region(&counter)])
        .unwrap();
    let err = ctx
        .queue("main")
        .unwrap()
        .launch("countCalls", &bound, &[], &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ForeignContext);
}

#[test]
fn test_freed_region_stays_valid_while_bound() {
    let ctx = context();
    let counter = ctx.allocate_array::<u32>("counter", 1).unwrap();
    let bound = ctx
        .kernel("countCalls")
        .unwrap()
        .bind(&ctx, &[Argument::region(&counter)])
        .unwrap();
    ctx.free(&counter).unwrap();
    assert_eq!(ctx.allocated_bytes(), 0);

    ctx.queue("main").unwrap().launch("countCalls", &bound, &[], &[]).unwrap();
    assert_eq!(counter.to_vec::<u32>().unwrap(), vec![1]);
}
