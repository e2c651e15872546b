//! Argument marshaling: converting runtime [`Argument`]s into the native
//! parameter types compute functions are written against.
//!
//! Each native type implements [`KernelArg`], which says what abstract
//! [`KernelType`] it stands for and how to build it from an argument. Tuples
//! of `KernelArg` implement [`KernelArgs`] and marshal position by position.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::context::{ensure_same_context, ComputeContext};
use crate::error::{Error, Result};
use crate::kernel::Parameter;
use crate::memory::{Argument, MemoryRegionHandle, Pin};
use crate::types::{copy_using_description, AccessMode, Describe, KernelType, ValueDescription};

/// A native compute-function parameter type.
pub trait KernelArg: Sized + Send + 'static {
    /// Abstract type this native type can serve.
    fn kernel_type() -> KernelType;

    fn native_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Build the native value from `arg`. A returned pin must outlive every
    /// use of the value.
    fn marshal(op: &str, arg: &Argument, ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)>;

    /// Integer size contributed to the kernel's expression environment:
    /// the value of an integer scalar, or the element count of an array.
    fn extent(&self) -> Option<i64> {
        None
    }
}

/// Copy a scalar argument into `T` through both value descriptions.
pub fn marshal_scalar<T: Describe + bytemuck::Pod>(op: &str, arg: &Argument) -> Result<T> {
    let primitive = arg.get_primitive(op)?;
    let mut value = T::zeroed();
    copy_using_description(
        &primitive.desc,
        &primitive.bytes,
        &T::describe(),
        bytemuck::bytes_of_mut(&mut value),
    )?;
    Ok(value)
}

macro_rules! integer_args {
    ($($ty:ty),+) => {
        $(
            impl KernelArg for $ty {
                fn kernel_type() -> KernelType {
                    KernelType::scalar::<$ty>()
                }

                fn marshal(op: &str, arg: &Argument, _ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
                    Ok((marshal_scalar::<$ty>(op, arg)?, None))
                }

                fn extent(&self) -> Option<i64> {
                    i64::try_from(*self).ok()
                }
            }
        )+
    };
}

integer_args!(u8, u16, u32, u64, i8, i16, i32, i64);

macro_rules! float_args {
    ($($ty:ty),+) => {
        $(
            impl KernelArg for $ty {
                fn kernel_type() -> KernelType {
                    KernelType::scalar::<$ty>()
                }

                fn marshal(op: &str, arg: &Argument, _ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
                    Ok((marshal_scalar::<$ty>(op, arg)?, None))
                }
            }
        )+
    };
}

float_args!(f32, f64);

fn check_element<T: Describe>(op: &str, element: Option<&Arc<ValueDescription>>) -> Result<()> {
    let native = T::describe();
    match element {
        Some(element) if element.type_name != native.type_name => Err(Error::conversion(
            format!("region of {element}"),
            format!("elements of {native}"),
            format!("{op}: element types differ"),
        )),
        _ => Ok(()),
    }
}

/// Reinterpret a byte range as `T` elements, truncating to whole elements.
fn typed_parts<T: Describe>(
    op: &str,
    ptr: NonNull<u8>,
    len_bytes: usize,
    element: Option<&Arc<ValueDescription>>,
) -> Result<(NonNull<T>, usize)> {
    check_element::<T>(op, element)?;
    if ptr.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
        return Err(Error::conversion(
            "byte range",
            std::any::type_name::<T>(),
            format!("{op}: range is not aligned to {} bytes", std::mem::align_of::<T>()),
        ));
    }
    let count = len_bytes / std::mem::size_of::<T>().max(1);
    Ok((ptr.cast::<T>(), count))
}

fn context_handle<T: Describe>(op: &str, arg: &Argument, ctx: &dyn ComputeContext) -> Result<MemoryRegionHandle> {
    let handle = arg.get_handle(op)?;
    ensure_same_context(op, &handle, ctx.id(), handle.context())?;
    check_element::<T>(op, Some(handle.element()))?;
    Ok(handle)
}

/// Owning handle to a writable array region.
pub struct ArrayHandle<T> {
    handle: MemoryRegionHandle,
    _element: PhantomData<fn() -> T>,
}

impl<T> ArrayHandle<T> {
    pub fn handle(&self) -> &MemoryRegionHandle {
        &self.handle
    }

    pub fn len(&self) -> usize {
        self.handle.element_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Describe> KernelArg for ArrayHandle<T> {
    fn kernel_type() -> KernelType {
        KernelType::array::<T>(AccessMode::ReadWrite)
    }

    fn marshal(op: &str, arg: &Argument, ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
        let handle = context_handle::<T>(op, arg, ctx)?;
        Ok((
            Self {
                handle,
                _element: PhantomData,
            },
            None,
        ))
    }

    fn extent(&self) -> Option<i64> {
        i64::try_from(self.len()).ok()
    }
}

/// Owning handle to a read-only array region.
pub struct ConstArrayHandle<T> {
    handle: MemoryRegionHandle,
    _element: PhantomData<fn() -> T>,
}

impl<T> ConstArrayHandle<T> {
    pub fn handle(&self) -> &MemoryRegionHandle {
        &self.handle
    }

    pub fn len(&self) -> usize {
        self.handle.element_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Describe> KernelArg for ConstArrayHandle<T> {
    fn kernel_type() -> KernelType {
        KernelType::array::<T>(AccessMode::ReadOnly)
    }

    fn marshal(op: &str, arg: &Argument, ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
        let handle = context_handle::<T>(op, arg, ctx)?;
        Ok((
            Self {
                handle,
                _element: PhantomData,
            },
            None,
        ))
    }

    fn extent(&self) -> Option<i64> {
        i64::try_from(self.len()).ok()
    }
}

/// Writable typed view of a range from a mutable-range argument. The view
/// is borrowed: the pin returned alongside it keeps the memory alive.
pub struct MutSpan<T> {
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: the span is only reachable through the bound kernel that also holds
// its pin, and launches of one bound kernel are serialized
unsafe impl<T: Send> Send for MutSpan<T> {}
unsafe impl<T: Sync> Sync for MutSpan<T> {}

impl<T: bytemuck::Pod> MutSpan<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: pointer and length come from a pinned, aligned range
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as for `as_slice`; `&mut self` gives exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Describe + bytemuck::Pod + Send> KernelArg for MutSpan<T> {
    fn kernel_type() -> KernelType {
        KernelType::array::<T>(AccessMode::ReadWrite)
    }

    fn marshal(op: &str, arg: &Argument, _ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
        let range = arg.get_range(op)?;
        let (ptr, len) = typed_parts::<T>(op, range.ptr(), range.len(), range.element())?;
        let (_, _, pin) = range.into_parts();
        Ok((Self { ptr, len }, Some(pin)))
    }

    fn extent(&self) -> Option<i64> {
        i64::try_from(self.len).ok()
    }
}

impl<T: bytemuck::Pod + fmt::Debug> fmt::Debug for MutSpan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// Read-only typed view of a range from a const-range argument.
pub struct ConstSpan<T> {
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: see `MutSpan`
unsafe impl<T: Sync> Send for ConstSpan<T> {}
unsafe impl<T: Sync> Sync for ConstSpan<T> {}

impl<T: bytemuck::Pod> ConstSpan<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: pointer and length come from a pinned, aligned range
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Describe + bytemuck::Pod + Sync> KernelArg for ConstSpan<T> {
    fn kernel_type() -> KernelType {
        KernelType::array::<T>(AccessMode::ReadOnly)
    }

    fn marshal(op: &str, arg: &Argument, _ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
        let range = arg.get_const_range(op)?;
        let (ptr, len) = typed_parts::<T>(op, range.ptr(), range.len(), range.element())?;
        let (_, _, pin) = range.into_parts();
        Ok((Self { ptr, len }, Some(pin)))
    }

    fn extent(&self) -> Option<i64> {
        i64::try_from(self.len).ok()
    }
}

/// Writable region that carries its own pin instead of returning it.
pub struct MutableRegion<T> {
    span: MutSpan<T>,
    _pin: Pin,
}

impl<T: bytemuck::Pod> MutableRegion<T> {
    pub fn len(&self) -> usize {
        self.span.len()
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        self.span.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.span.as_mut_slice()
    }
}

impl<T: Describe + bytemuck::Pod + Send + Sync> KernelArg for MutableRegion<T> {
    fn kernel_type() -> KernelType {
        KernelType::array::<T>(AccessMode::ReadWrite)
    }

    fn marshal(op: &str, arg: &Argument, ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
        let (span, pin) = MutSpan::<T>::marshal(op, arg, ctx)?;
        let pin = pin.ok_or_else(|| Error::invalid_region(format!("{op}: range came without a pin")))?;
        Ok((Self { span, _pin: pin }, None))
    }

    fn extent(&self) -> Option<i64> {
        self.span.extent()
    }
}

/// Read-only region that carries its own pin.
pub struct FrozenRegion<T> {
    span: ConstSpan<T>,
    _pin: Pin,
}

impl<T: bytemuck::Pod> FrozenRegion<T> {
    pub fn len(&self) -> usize {
        self.span.len()
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        self.span.as_slice()
    }
}

impl<T: Describe + bytemuck::Pod + Sync> KernelArg for FrozenRegion<T> {
    fn kernel_type() -> KernelType {
        KernelType::array::<T>(AccessMode::ReadOnly)
    }

    fn marshal(op: &str, arg: &Argument, ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
        let (span, pin) = ConstSpan::<T>::marshal(op, arg, ctx)?;
        let pin = pin.ok_or_else(|| Error::invalid_region(format!("{op}: range came without a pin")))?;
        Ok((Self { span, _pin: pin }, None))
    }

    fn extent(&self) -> Option<i64> {
        self.span.extent()
    }
}

/// Raw writable pointer parameter. No argument converts to it.
pub struct HostPtr<T>(PhantomData<fn() -> T>);

/// Raw read-only pointer parameter. No argument converts to it.
pub struct ConstHostPtr<T>(PhantomData<fn() -> T>);

impl<T: Describe> KernelArg for HostPtr<T> {
    fn kernel_type() -> KernelType {
        KernelType::array::<T>(AccessMode::ReadWrite)
    }

    fn marshal(op: &str, _arg: &Argument, _ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
        Err(Error::UnsupportedConversion {
            op: op.to_string(),
            target: Self::native_name().to_string(),
        })
    }
}

impl<T: Describe> KernelArg for ConstHostPtr<T> {
    fn kernel_type() -> KernelType {
        KernelType::array::<T>(AccessMode::ReadOnly)
    }

    fn marshal(op: &str, _arg: &Argument, _ctx: &dyn ComputeContext) -> Result<(Self, Option<Pin>)> {
        Err(Error::UnsupportedConversion {
            op: op.to_string(),
            target: Self::native_name().to_string(),
        })
    }
}

/// Result of marshaling a whole argument list
pub struct Marshaled<A> {
    pub values: A,
    pub pins: Vec<Pin>,
    pub extents: Vec<Option<i64>>,
}

/// A full native parameter list, implemented for tuples of [`KernelArg`].
pub trait KernelArgs: Sized + Send + 'static {
    const LEN: usize;

    fn kernel_types() -> Vec<KernelType>;

    fn native_names() -> Vec<&'static str>;

    fn marshal_all(
        kernel: &str,
        params: &[Parameter],
        args: &[Argument],
        ctx: &dyn ComputeContext,
    ) -> Result<Marshaled<Self>>;
}

fn bind_one<T: KernelArg>(
    kernel: &str,
    param: &Parameter,
    arg: &Argument,
    ctx: &dyn ComputeContext,
    pins: &mut Vec<Pin>,
    extents: &mut Vec<Option<i64>>,
) -> Result<T> {
    let op = format!("kernel {kernel} bind param {} {}", param.ordinal, param.name);
    let (value, pin) = T::marshal(&op, arg, ctx).map_err(|source| Error::Bind {
        kernel: kernel.to_string(),
        index: param.ordinal,
        name: param.name.clone(),
        passed: arg.type_name(),
        required: T::native_name().to_string(),
        declared: param.ty.to_string(),
        source: Box::new(source),
    })?;
    tracing::trace!(kernel, param = %param.name, pinned = pin.is_some(), "marshaled argument");
    pins.extend(pin);
    extents.push(value.extent());
    Ok(value)
}

macro_rules! kernel_args_tuple {
    ($len:expr; $($ty:ident => $idx:tt),*) => {
        impl<$($ty: KernelArg),*> KernelArgs for ($($ty,)*) {
            const LEN: usize = $len;

            fn kernel_types() -> Vec<KernelType> {
                vec![$($ty::kernel_type()),*]
            }

            fn native_names() -> Vec<&'static str> {
                vec![$($ty::native_name()),*]
            }

            #[allow(unused_variables, unused_mut)]
            fn marshal_all(
                kernel: &str,
                params: &[Parameter],
                args: &[Argument],
                ctx: &dyn ComputeContext,
            ) -> Result<Marshaled<Self>> {
                if args.len() != Self::LEN {
                    return Err(Error::arity(kernel, Self::LEN, args.len()));
                }
                if params.len() != Self::LEN {
                    return Err(Error::signature(
                        kernel,
                        format!("compute function takes {} parameters but {} are declared", Self::LEN, params.len()),
                    ));
                }
                let mut pins = Vec::new();
                let mut extents = Vec::with_capacity(Self::LEN);
                let values = ($(bind_one::<$ty>(kernel, &params[$idx], &args[$idx], ctx, &mut pins, &mut extents)?,)*);
                Ok(Marshaled { values, pins, extents })
            }
        }
    };
}

kernel_args_tuple!(0;);
kernel_args_tuple!(1; A => 0);
kernel_args_tuple!(2; A => 0, B => 1);
kernel_args_tuple!(3; A => 0, B => 1, C => 2);
kernel_args_tuple!(4; A => 0, B => 1, C => 2, D => 3);
kernel_args_tuple!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
kernel_args_tuple!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);
kernel_args_tuple!(7; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6);
kernel_args_tuple!(8; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7);
kernel_args_tuple!(9; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8);
kernel_args_tuple!(10; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9);
kernel_args_tuple!(11; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10);
kernel_args_tuple!(12; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10, L => 11);
