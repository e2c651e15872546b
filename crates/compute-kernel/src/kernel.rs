//! Kernel descriptions and the binding protocol.
//!
//! A [`Kernel`] is built once per context by a registered factory: it names
//! its parameters with abstract types, optionally describes its grid, and
//! carries a compute function (host backends) or a callable factory (device
//! backends). [`Kernel::bind`] turns runtime arguments into a [`BoundKernel`].

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::bound::{BoundCallable, BoundKernel};
use crate::context::ComputeContext;
use crate::error::{Error, Result};
use crate::expr::{Bindings, Expr};
use crate::grid::GridRange;
use crate::invoke::{HostBody, HostFactory};
use crate::marshal::KernelArgs;
use crate::memory::{Argument, Pin};
use crate::types::{AccessMode, ArrayLength, KernelType, Shape};

/// Most grid dimensions a kernel may iterate over.
pub const MAX_GRID_DIMENSIONS: usize = 3;

/// A declared kernel parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub ty: KernelType,
    pub ordinal: usize,
}

/// A named grid dimension whose extent is an expression over the bound
/// arguments and tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct GridDimension {
    pub name: String,
    pub range: Expr,
    pub pad_block: Option<u32>,
}

/// Device launch geometry: a list expression for the global grid and an
/// optional one for the work-group (thread-group) size.
#[derive(Debug, Clone, PartialEq)]
pub struct GridExpression {
    pub grid: Expr,
    pub block: Option<Expr>,
}

/// Output of a [`CallableFactory`]
pub struct Binding {
    pub callable: Box<dyn BoundCallable>,
    pub pins: Vec<Pin>,
    /// Per-parameter integer extents, see [`crate::KernelArg::extent`].
    pub extents: Vec<Option<i64>>,
}

/// Backend hook that converts arguments into a launchable callable.
pub trait CallableFactory: Send + Sync {
    /// Number of grid dimensions the produced callables expect.
    fn grid_arity(&self) -> usize;

    fn create(&self, ctx: &dyn ComputeContext, kernel: &Kernel, args: &[Argument]) -> Result<Binding>;
}

/// Backend-agnostic kernel description
pub struct Kernel {
    name: String,
    params: Vec<Parameter>,
    dims: Vec<GridDimension>,
    tunables: Bindings,
    grid_expr: Option<GridExpression>,
    allow_grid_padding: bool,
    factory: Option<Arc<dyn CallableFactory>>,
}

impl Kernel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            dims: Vec::new(),
            tunables: Bindings::new(),
            grid_expr: None,
            allow_grid_padding: false,
            factory: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn dimensions(&self) -> &[GridDimension] {
        &self.dims
    }

    pub fn tunables(&self) -> &Bindings {
        &self.tunables
    }

    pub fn grid_expression(&self) -> Option<&GridExpression> {
        self.grid_expr.as_ref()
    }

    pub fn allows_grid_padding(&self) -> bool {
        self.allow_grid_padding
    }

    pub fn has_compute_function(&self) -> bool {
        self.factory.is_some()
    }

    /// Grid dimensionality of the installed compute function.
    pub fn grid_arity(&self) -> Option<usize> {
        self.factory.as_ref().map(|f| f.grid_arity())
    }

    // ----- description builder -----

    pub fn add_dimension(&mut self, name: &str, range: &str) -> Result<&mut Self> {
        self.push_dimension(name, range, None)
    }

    /// Like [`Kernel::add_dimension`]; when grid padding is allowed the
    /// iterated extent is rounded up to a multiple of `block`.
    pub fn add_padded_dimension(&mut self, name: &str, range: &str, block: u32) -> Result<&mut Self> {
        if block == 0 {
            return Err(Error::declaration(&self.name, format!("dimension '{name}' has a zero padding block")));
        }
        self.push_dimension(name, range, Some(block))
    }

    fn push_dimension(&mut self, name: &str, range: &str, pad_block: Option<u32>) -> Result<&mut Self> {
        if self.dims.len() == MAX_GRID_DIMENSIONS {
            return Err(Error::declaration(
                &self.name,
                format!("at most {MAX_GRID_DIMENSIONS} grid dimensions are supported"),
            ));
        }
        if self.dims.iter().any(|d| d.name == name) {
            return Err(Error::declaration(&self.name, format!("dimension '{name}' declared twice")));
        }
        self.dims.push(GridDimension {
            name: name.to_string(),
            range: Expr::parse(range)?,
            pad_block,
        });
        Ok(self)
    }

    pub fn allow_grid_padding(&mut self) -> &mut Self {
        self.allow_grid_padding = true;
        self
    }

    /// Declare the next parameter. `access` is `"r"`, `"w"` or `"rw"`;
    /// `type_expr` is e.g. `"u32"`, `"f32[]"` or `"u32[nf + 1]"`.
    pub fn add_parameter(&mut self, name: &str, access: &str, type_expr: &str) -> Result<&mut Self> {
        if self.parameter(name).is_some() {
            return Err(Error::declaration(&self.name, format!("parameter '{name}' declared twice")));
        }
        let ty = KernelType::parse(type_expr, AccessMode::parse(access)?)?;
        self.params.push(Parameter {
            name: name.to_string(),
            ty,
            ordinal: self.params.len(),
        });
        Ok(self)
    }

    pub fn add_tunable(&mut self, name: &str, value: i64) -> &mut Self {
        self.tunables.insert(name.to_string(), value);
        self
    }

    pub fn set_grid_expression(&mut self, grid: &str, block: Option<&str>) -> Result<&mut Self> {
        self.grid_expr = Some(GridExpression {
            grid: Expr::parse(grid)?,
            block: block.map(Expr::parse).transpose()?,
        });
        Ok(self)
    }

    /// Install a device backend's callable factory.
    pub fn set_callable_factory(&mut self, factory: Arc<dyn CallableFactory>) -> &mut Self {
        self.factory = Some(factory);
        self
    }

    // ----- compute functions, one per invocation shape -----

    /// Run once per launch with no grid.
    pub fn set_compute_function<A, F>(&mut self, f: F) -> Result<&mut Self>
    where
        A: KernelArgs,
        F: Fn(&dyn ComputeContext, &mut A) + Send + Sync + 'static,
    {
        self.install::<A>(HostBody::Grid0(Box::new(f)))
    }

    /// Run once per index `i` of a 1-D grid of extent `n`.
    pub fn set_compute_function_1d<A, F>(&mut self, f: F) -> Result<&mut Self>
    where
        A: KernelArgs,
        F: Fn(&dyn ComputeContext, u32, u32, &mut A) + Send + Sync + 'static,
    {
        self.install::<A>(HostBody::Grid1(Box::new(f)))
    }

    /// Run once with the whole 1-D range.
    pub fn set_compute_function_1d_range<A, F>(&mut self, f: F) -> Result<&mut Self>
    where
        A: KernelArgs,
        F: Fn(&dyn ComputeContext, &GridRange, &mut A) + Send + Sync + 'static,
    {
        self.install::<A>(HostBody::Grid1Range(Box::new(f)))
    }

    pub fn set_compute_function_2d<A, F>(&mut self, f: F) -> Result<&mut Self>
    where
        A: KernelArgs,
        F: Fn(&dyn ComputeContext, u32, u32, u32, u32, &mut A) + Send + Sync + 'static,
    {
        self.install::<A>(HostBody::Grid2(Box::new(f)))
    }

    pub fn set_compute_function_2d_index_range<A, F>(&mut self, f: F) -> Result<&mut Self>
    where
        A: KernelArgs,
        F: Fn(&dyn ComputeContext, u32, u32, &GridRange, &mut A) + Send + Sync + 'static,
    {
        self.install::<A>(HostBody::Grid2IndexRange(Box::new(f)))
    }

    pub fn set_compute_function_2d_range_index<A, F>(&mut self, f: F) -> Result<&mut Self>
    where
        A: KernelArgs,
        F: Fn(&dyn ComputeContext, &GridRange, u32, u32, &mut A) + Send + Sync + 'static,
    {
        self.install::<A>(HostBody::Grid2RangeIndex(Box::new(f)))
    }

    pub fn set_compute_function_3d_index_index_range<A, F>(&mut self, f: F) -> Result<&mut Self>
    where
        A: KernelArgs,
        F: Fn(&dyn ComputeContext, u32, u32, u32, u32, &GridRange, &mut A) + Send + Sync + 'static,
    {
        self.install::<A>(HostBody::Grid3IndexIndexRange(Box::new(f)))
    }

    pub fn set_compute_function_3d_range_index_index<A, F>(&mut self, f: F) -> Result<&mut Self>
    where
        A: KernelArgs,
        F: Fn(&dyn ComputeContext, &GridRange, u32, u32, u32, u32, &mut A) + Send + Sync + 'static,
    {
        self.install::<A>(HostBody::Grid3RangeIndexIndex(Box::new(f)))
    }

    fn install<A: KernelArgs>(&mut self, body: HostBody<A>) -> Result<&mut Self> {
        self.check_signature::<A>()?;
        self.factory = Some(Arc::new(HostFactory::new(body)));
        Ok(self)
    }

    fn check_signature<A: KernelArgs>(&self) -> Result<()> {
        if A::LEN != self.params.len() {
            return Err(Error::signature(
                &self.name,
                format!(
                    "compute function takes {} parameters but {} are declared",
                    A::LEN,
                    self.params.len()
                ),
            ));
        }
        for ((param, native), native_name) in self.params.iter().zip(A::kernel_types()).zip(A::native_names()) {
            param.ty.accepts(&native).map_err(|reason| {
                Error::signature(
                    &self.name,
                    format!("parameter {} ('{}') as {native_name}: {reason}", param.ordinal, param.name),
                )
            })?;
        }
        Ok(())
    }

    // ----- binding -----

    /// Convert `args` and produce a launchable [`BoundKernel`].
    ///
    /// No device work happens here; the bound kernel holds every pin the
    /// conversion produced.
    pub fn bind(&self, ctx: &dyn ComputeContext, args: &[Argument]) -> Result<BoundKernel> {
        if args.len() != self.params.len() {
            return Err(Error::arity(&self.name, self.params.len(), args.len()));
        }
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| Error::NoComputeFunction(self.name.clone()))?;
        let grid_arity = factory.grid_arity();
        if !self.dims.is_empty() && self.dims.len() != grid_arity {
            return Err(Error::declaration(
                &self.name,
                format!(
                    "{} grid dimensions declared but the compute function iterates over {grid_arity}",
                    self.dims.len()
                ),
            ));
        }

        let binding = factory.create(ctx, self, args)?;
        let bindings = self.resolve_bindings(&binding.extents);
        self.check_lengths(args, &binding.extents, &bindings)?;
        let default_grid = self.default_grid(grid_arity, &bindings);
        let pad_blocks = if self.allow_grid_padding && !self.dims.is_empty() {
            self.dims.iter().map(|d| d.pad_block).collect()
        } else {
            vec![None; grid_arity]
        };

        debug!(
            kernel = %self.name,
            context = %ctx.id(),
            pins = binding.pins.len(),
            default_grid = ?default_grid,
            "bound kernel"
        );

        Ok(BoundKernel::new(
            self.name.clone(),
            ctx.id(),
            grid_arity,
            binding.callable,
            binding.pins,
            bindings,
            default_grid,
            pad_blocks,
        ))
    }

    /// Tunables plus integer scalar arguments by parameter name, plus array
    /// lengths under the identifier their declared length names.
    pub fn resolve_bindings(&self, extents: &[Option<i64>]) -> Bindings {
        let mut env = self.tunables.clone();
        let with_extents = || self.params.iter().zip(extents).filter_map(|(p, e)| e.map(|e| (p, e)));
        for (param, extent) in with_extents() {
            if param.ty.shape == Shape::Scalar {
                env.insert(param.name.clone(), extent);
            }
        }
        for (param, extent) in with_extents() {
            if let Shape::Array(ArrayLength::Bounded(len) | ArrayLength::Exact(len)) = &param.ty.shape {
                if let Some(ident) = len.as_identifier() {
                    env.entry(ident.to_string()).or_insert(extent);
                }
            }
        }
        env
    }

    fn check_lengths(&self, args: &[Argument], extents: &[Option<i64>], env: &Bindings) -> Result<()> {
        for ((param, extent), arg) in self.params.iter().zip(extents).zip(args) {
            let (Shape::Array(length), Some(actual)) = (&param.ty.shape, *extent) else {
                continue;
            };
            let (expr, exact) = match length {
                ArrayLength::Unbounded => continue,
                ArrayLength::Bounded(expr) => (expr, false),
                ArrayLength::Exact(expr) => (expr, true),
            };
            // lengths naming values that were not bound cannot be checked
            let Ok(required) = expr.eval(env) else {
                continue;
            };
            let fits = if exact { actual == required } else { actual >= required };
            if !fits {
                return Err(Error::Bind {
                    kernel: self.name.clone(),
                    index: param.ordinal,
                    name: param.name.clone(),
                    passed: arg.type_name(),
                    required: format!("{} elements", required),
                    declared: param.ty.to_string(),
                    source: Box::new(Error::conversion(
                        format!("{actual} elements"),
                        param.ty.to_string(),
                        format!(
                            "array holds {actual} elements but {}{required} are required",
                            if exact { "exactly " } else { "at least " }
                        ),
                    )),
                });
            }
        }
        Ok(())
    }

    fn default_grid(&self, grid_arity: usize, env: &Bindings) -> Option<Vec<u32>> {
        let extents: Vec<i64> = if !self.dims.is_empty() {
            self.dims
                .iter()
                .map(|d| d.range.eval(env))
                .collect::<Result<_>>()
                .ok()?
        } else if let Some(geometry) = &self.grid_expr {
            geometry.grid.eval_list(env).ok()?
        } else if grid_arity == 0 {
            Vec::new()
        } else {
            return None;
        };
        if extents.len() != grid_arity {
            return None;
        }
        extents.into_iter().map(|e| u32::try_from(e).ok()).collect()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("dims", &self.dims)
            .field("tunables", &self.tunables)
            .field("grid_expr", &self.grid_expr)
            .field("allow_grid_padding", &self.allow_grid_padding)
            .field("grid_arity", &self.grid_arity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::marshal::{ConstSpan, MutSpan};
    use crate::memory::test_support::region;
    use crate::testing::NullContext;

    fn copy_kernel() -> Kernel {
        let mut kernel = Kernel::new("copy");
        kernel
            .add_parameter("output", "rw", "u32[n]")
            .unwrap()
            .add_parameter("input", "r", "u32[n]")
            .unwrap()
            .add_parameter("n", "r", "u32")
            .unwrap()
            .add_dimension("i", "n")
            .unwrap();
        kernel
            .set_compute_function_1d(
                |_ctx, i, n, (output, input, _): &mut (MutSpan<u32>, ConstSpan<u32>, u32)| {
                    if i < n {
                        output.as_mut_slice()[i as usize] = input.as_slice()[i as usize];
                    }
                },
            )
            .unwrap();
        kernel
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let mut kernel = Kernel::new("k");
        kernel.add_parameter("x", "r", "u32").unwrap();
        assert_eq!(
            kernel.add_parameter("x", "r", "u32").unwrap_err().kind(),
            ErrorKind::Declaration
        );
        kernel.add_dimension("i", "x").unwrap();
        assert!(kernel.add_dimension("i", "x").is_err());
        assert!(kernel.add_padded_dimension("j", "x", 0).is_err());
    }

    #[test]
    fn test_signature_checked_when_installing() {
        let mut kernel = Kernel::new("k");
        kernel.add_parameter("data", "r", "u32[]").unwrap();

        let err = kernel
            .set_compute_function(|_ctx, _args: &mut (MutSpan<u32>,)| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Signature);

        let err = kernel
            .set_compute_function(|_ctx, _args: &mut (ConstSpan<u32>, u32)| {})
            .unwrap_err();
        assert!(err.to_string().contains("takes 2 parameters"));

        assert!(kernel
            .set_compute_function(|_ctx, _args: &mut (ConstSpan<u32>,)| {})
            .is_ok());
    }

    #[test]
    fn test_arity_checked_before_conversion() {
        let ctx = NullContext::new();
        let kernel = copy_kernel();
        let err = kernel.bind(&ctx, &[Argument::value(1u32)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Arity);
        assert!(err.to_string().contains("not enough parameters"));
    }

    #[test]
    fn test_missing_compute_function() {
        let ctx = NullContext::new();
        let mut kernel = Kernel::new("empty");
        kernel.add_parameter("n", "r", "u32").unwrap();
        let err = kernel.bind(&ctx, &[Argument::value(1u32)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoComputeFunction);
    }

    #[test]
    fn test_bind_resolves_default_grid() {
        let ctx = NullContext::new();
        let output = region::<u32>(ctx.id(), "output", 8);
        let input = region::<u32>(ctx.id(), "input", 8);
        let bound = copy_kernel()
            .bind(
                &ctx,
                &[
                    Argument::region(&output),
                    Argument::const_region(&input),
                    Argument::value(5u32),
                ],
            )
            .unwrap();
        assert_eq!(bound.default_grid(), Some(&[5u32][..]));
        assert_eq!(bound.bindings().get("n"), Some(&5));
        assert_eq!(bound.pin_count(), 2);
    }

    #[test]
    fn test_bind_checks_declared_lengths() {
        let ctx = NullContext::new();
        let output = region::<u32>(ctx.id(), "output", 2);
        let input = region::<u32>(ctx.id(), "input", 8);
        let err = copy_kernel()
            .bind(
                &ctx,
                &[
                    Argument::region(&output),
                    Argument::const_region(&input),
                    Argument::value(5u32),
                ],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeConversion);
        assert!(err.to_string().contains("'output'"));
    }

    #[test]
    fn test_padding_applies_only_when_allowed() {
        let ctx = NullContext::new();
        let mut kernel = Kernel::new("pad");
        kernel.add_parameter("n", "r", "u32").unwrap();
        kernel.add_padded_dimension("i", "n", 8).unwrap();
        kernel
            .set_compute_function_1d(|_ctx, _i, _n, _args: &mut (u32,)| {})
            .unwrap();

        let bound = kernel.bind(&ctx, &[Argument::value(10u32)]).unwrap();
        assert_eq!(bound.grid_for(&[10]).unwrap()[0].padded_extent(), 10);

        kernel.allow_grid_padding();
        let bound = kernel.bind(&ctx, &[Argument::value(10u32)]).unwrap();
        let grid = bound.grid_for(&[10]).unwrap();
        assert_eq!(grid[0].extent(), 10);
        assert_eq!(grid[0].padded_extent(), 16);
    }

    #[test]
    fn test_dimension_count_must_match_shape() {
        let ctx = NullContext::new();
        let mut kernel = Kernel::new("mismatch");
        kernel.add_parameter("n", "r", "u32").unwrap();
        kernel.add_dimension("i", "n").unwrap();
        kernel.add_dimension("j", "n").unwrap();
        kernel
            .set_compute_function_1d(|_ctx, _i, _n, _args: &mut (u32,)| {})
            .unwrap();
        let err = kernel.bind(&ctx, &[Argument::value(3u32)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Declaration);
    }

    #[test]
    fn test_tunables_feed_grid_expression() {
        let ctx = NullContext::new();
        let mut kernel = Kernel::new("tiles");
        kernel
            .add_parameter("n", "r", "u32")
            .unwrap()
            .add_tunable("tile", 4)
            .set_grid_expression("[ceilDiv(n, tile), tile]", None)
            .unwrap();
        kernel
            .set_compute_function_2d(|_ctx, _i0, _n0, _i1, _n1, _args: &mut (u32,)| {})
            .unwrap();
        let bound = kernel.bind(&ctx, &[Argument::value(10u32)]).unwrap();
        assert_eq!(bound.default_grid(), Some(&[3u32, 4][..]));
    }
}
