// SPDX-License-Identifier: BSD-3-Clause
//! Materialization of a function's inputs from its secrecy description.
//!
//! Every pointer parameter gets a fresh object for its pointee (and so on,
//! recursively), except where the description or the type says otherwise.
//! A pointer to a struct that is already being built further up the same
//! chain points back at that object, so recursive types such as
//! parent/child graphs give finite, cyclic memory.

use tracing::{debug, trace};

use crate::{
    abstractdata::{Abstract, AbstractValue, Params, SecrecySpec, SpecError},
    analysis::Options,
    ir::{Function, Module, Type},
    lattice::{i_min, u_max, Interval, Taint},
    memory::{
        value::Symbol, IntValue, Location, Memory, Object, ObjectId, PointerValue, Region, Value,
    },
};

/// Memory and argument values at function entry.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) memory: Memory,
    pub(crate) args: Vec<Value>,
    pub(crate) next_symbol: Symbol,
}

fn deref(place: &str) -> String {
    format!("*{}", place)
}

fn field_place(place: &str, field: &str) -> String {
    match place.strip_prefix('*') {
        Some(inner) => format!("{}->{}", inner, field),
        None => format!("{}.{}", place, field),
    }
}

fn element_place(place: &str) -> String {
    format!("{}[*]", place.strip_prefix('*').unwrap_or(place))
}

#[derive(Clone, Copy, Debug)]
struct Ctx {
    /// Pointer levels below the parameter
    depth: usize,
    /// Everything `default` is secret
    secret: bool,
    /// Inside an object that stands for many values
    summarized: bool,
}

impl Ctx {
    fn below_pointer(self) -> Self {
        Ctx {
            depth: self.depth + 1,
            summarized: false,
            ..self
        }
    }

    fn taint(self, place: &str) -> Taint {
        if self.secret {
            Taint::secret(place)
        } else {
            Taint::public()
        }
    }
}

struct Builder<'a> {
    module: &'a Module,
    spec: &'a SecrecySpec,
    opts: &'a Options,
    memory: Memory,
    next_symbol: Symbol,
    /// Structs under construction, innermost last
    ancestors: Vec<(String, ObjectId)>,
}

/// Descriptions of the parameters of `function`, in order.
fn parameter_descriptions(
    function: &Function,
    spec: &SecrecySpec,
) -> Result<Vec<Abstract>, SpecError> {
    let n = function.params.len();
    match spec.functions.get(function.name.get()) {
        Some(fs) => match &fs.params {
            Params::Positional(ps) => {
                if ps.len() != n {
                    return Err(SpecError::Arity {
                        function: function.name.to_string(),
                        expected: n,
                        got: ps.len(),
                    });
                }
                Ok(ps.clone())
            }
            Params::Named(ps) => {
                let mut out = vec![Abstract::Default; n];
                for (name, data) in ps {
                    let idx =
                        function
                            .param_index(name)
                            .ok_or_else(|| SpecError::UnknownParameter {
                                function: function.name.to_string(),
                                name: name.clone(),
                            })?;
                    out[idx] = data.clone();
                }
                Ok(out)
            }
        },
        None if spec.all_secret => Ok(vec![Abstract::Secret; n]),
        None => Ok(vec![Abstract::Default; n]),
    }
}

pub(crate) fn materialize(
    module: &Module,
    function: &Function,
    spec: &SecrecySpec,
    opts: &Options,
) -> Result<Entry, SpecError> {
    let descriptions = parameter_descriptions(function, spec)?;
    let mut b = Builder {
        module,
        spec,
        opts,
        memory: Memory::new(),
        next_symbol: 0,
        ancestors: Vec::new(),
    };
    let ctx = Ctx {
        depth: 0,
        secret: false,
        summarized: false,
    };
    let mut args = Vec::with_capacity(descriptions.len());
    for (param, data) in function.params.iter().zip(descriptions.iter()) {
        let place = param.name.get();
        match &param.ty {
            Type::Int { .. } | Type::Pointer(_) => (),
            ty => {
                return Err(SpecError::TypeMismatch {
                    place: place.to_string(),
                    data: data.kind().to_string(),
                    ty: ty.clone(),
                })
            }
        }
        let v = b.value(&param.ty, data, place, ctx)?;
        trace!(param = place, value = %v, "argument");
        args.push(v);
    }
    debug!(
        function = %function.name,
        objects = b.memory.len(),
        "materialized inputs"
    );
    Ok(Entry {
        memory: b.memory,
        args,
        next_symbol: b.next_symbol,
    })
}

impl<'a> Builder<'a> {
    fn fresh(&mut self) -> Symbol {
        let s = self.next_symbol;
        self.next_symbol += 1;
        s
    }

    fn symbol(&mut self, ctx: Ctx) -> Option<Symbol> {
        if ctx.summarized {
            None
        } else {
            Some(self.fresh())
        }
    }

    fn mismatch(place: &str, data: &Abstract, ty: &Type) -> SpecError {
        SpecError::TypeMismatch {
            place: place.to_string(),
            data: data.kind().to_string(),
            ty: ty.clone(),
        }
    }

    fn ancestor(&self, name: &str) -> Option<ObjectId> {
        self.ancestors
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    /// The struct description to use where `default` meets struct `name`.
    fn struct_description(&self, name: &str) -> Option<&'a Abstract> {
        match self.spec.structs.get(name) {
            Some(Abstract::Default) | None => None,
            Some(d) => Some(d),
        }
    }

    fn pointer(&mut self, loc: Location, maybe_null: bool, ctx: Ctx) -> Value {
        let symbol = self.symbol(ctx);
        Value::Ptr(PointerValue {
            taint: Taint::public(),
            targets: [loc].into_iter().collect(),
            functions: Default::default(),
            maybe_null,
            symbol,
        })
    }

    fn public_int(
        &mut self,
        bits: u32,
        v: &AbstractValue,
        place: &str,
        ctx: Ctx,
    ) -> Result<Value, SpecError> {
        let bad = |value: String| SpecError::BadValue {
            place: place.to_string(),
            value,
            bits,
        };
        let fits = |x: i64| (i_min(bits)..=u_max(bits)).contains(&(x as i128));
        let range = match v {
            AbstractValue::Exact(x) if fits(*x) => Interval::exact(*x as i128),
            AbstractValue::Exact(x) => return Err(bad(x.to_string())),
            AbstractValue::Range(lo, hi) if fits(*lo) && fits(*hi) => {
                Interval::new(*lo as i128, *hi as i128)
                    .ok_or_else(|| bad(format!("[{}, {}]", lo, hi)))?
            }
            AbstractValue::Range(lo, hi) => return Err(bad(format!("[{}, {}]", lo, hi))),
            AbstractValue::Unconstrained => Interval::full(bits),
        };
        let symbol = if range.as_exact().is_some() {
            None
        } else {
            self.symbol(ctx)
        };
        Ok(Value::Int(IntValue {
            taint: Taint::public(),
            bits,
            range,
            symbol,
            cond: None,
        }))
    }

    /// A single leaf: an integer or a pointer.
    fn value(
        &mut self,
        ty: &Type,
        data: &Abstract,
        place: &str,
        ctx: Ctx,
    ) -> Result<Value, SpecError> {
        match (ty, data) {
            (Type::Int { bits }, Abstract::Secret) => Ok(Value::Int(IntValue::unconstrained(
                *bits,
                Taint::secret(place),
            ))),
            (Type::Int { bits }, Abstract::Default) => {
                if ctx.secret {
                    Ok(Value::Int(IntValue::unconstrained(
                        *bits,
                        Taint::secret(place),
                    )))
                } else {
                    self.public_int(*bits, &AbstractValue::Unconstrained, place, ctx)
                }
            }
            (Type::Int { bits }, Abstract::Public(v)) => self.public_int(*bits, v, place, ctx),

            // The pointer itself stays public
            (Type::Pointer(pointee), Abstract::Secret) => self.default_pointer(
                pointee,
                place,
                Ctx {
                    secret: true,
                    ..ctx
                },
            ),
            (Type::Pointer(pointee), Abstract::Default) => {
                self.default_pointer(pointee, place, ctx)
            }
            (Type::Pointer(pointee), Abstract::PointerTo(inner)) => {
                let loc = self.pointee(pointee, inner, place, ctx)?;
                Ok(self.pointer(loc, false, ctx))
            }
            (Type::Pointer(pointee), Abstract::MaybeNullPointerTo(inner)) => {
                let loc = self.pointee(pointee, inner, place, ctx)?;
                Ok(self.pointer(loc, true, ctx))
            }
            (Type::Pointer(_), Abstract::PointerToUnconstrained) => {
                Ok(self.unconstrained_pointer(place, ctx))
            }
            (Type::Pointer(pointee), Abstract::PointerToParent) => {
                let parent = match &**pointee {
                    Type::Struct(name) => self.ancestor(name),
                    _ => self.ancestors.last().map(|(_, id)| *id),
                };
                match parent {
                    Some(id) => Ok(self.pointer(Location::new(id, 0), false, ctx)),
                    None => Err(SpecError::NoParent(place.to_string())),
                }
            }
            (Type::Pointer(_), Abstract::PointerToFunction(name)) => {
                let f = self
                    .module
                    .functions
                    .keys()
                    .chain(self.module.decls.keys())
                    .find(|f| f.get() == name)
                    .ok_or_else(|| SpecError::UnknownFunction {
                        place: place.to_string(),
                        name: name.clone(),
                    })?;
                Ok(Value::Ptr(PointerValue::function(f.clone())))
            }
            (ty, data) => Err(Self::mismatch(place, data, ty)),
        }
    }

    fn unconstrained_pointer(&mut self, place: &str, ctx: Ctx) -> Value {
        let name = element_place(&deref(place));
        let cell = Value::Unknown(ctx.taint(&name));
        let id = self
            .memory
            .allocate(Object::summarized(name, Region::Input, vec![cell]));
        self.pointer(Location::new(id, 0), false, ctx)
    }

    fn default_pointer(
        &mut self,
        pointee: &Type,
        place: &str,
        ctx: Ctx,
    ) -> Result<Value, SpecError> {
        if let Type::Struct(name) = pointee {
            if let Some(id) = self.ancestor(name) {
                return Ok(self.pointer(Location::new(id, 0), false, ctx));
            }
        }
        if ctx.depth >= self.opts.pointee_depth {
            return Ok(self.unconstrained_pointer(place, ctx));
        }
        let loc = self.pointee(pointee, &Abstract::Default, place, ctx)?;
        Ok(self.pointer(loc, false, ctx))
    }

    /// Build the object a pointer at `place` points to.
    fn pointee(
        &mut self,
        pointee: &Type,
        data: &Abstract,
        place: &str,
        ctx: Ctx,
    ) -> Result<Location, SpecError> {
        let name = deref(place);
        let inner = ctx.below_pointer();
        match (pointee, data) {
            (_, Abstract::VoidOverride { ty, data }) => self.pointee(ty, data, place, ctx),

            (Type::Void, Abstract::Default | Abstract::Secret) => {
                let secret = ctx.secret || matches!(data, Abstract::Secret);
                let name = element_place(&name);
                let cell = Value::Unknown(Ctx { secret, ..ctx }.taint(&name));
                let id = self
                    .memory
                    .allocate(Object::summarized(name, Region::Input, vec![cell]));
                Ok(Location::new(id, 0))
            }
            (Type::Void, data) => Err(Self::mismatch(place, data, pointee)),

            (Type::Int { .. } | Type::Pointer(_), Abstract::Array { element, len }) => {
                let ename = element_place(&name);
                let mut cells = Vec::with_capacity(*len);
                for _ in 0..*len {
                    cells.push(self.value(pointee, element, &ename, inner)?);
                }
                let id = self
                    .memory
                    .allocate(Object::new(name, Region::Input, cells));
                Ok(Location::new(id, 0))
            }
            // A pointer to a scalar may point into a buffer of any length
            (Type::Int { .. } | Type::Pointer(_), data) => {
                let ename = element_place(&name);
                let cell = self.value(
                    pointee,
                    data,
                    &ename,
                    Ctx {
                        summarized: true,
                        ..inner
                    },
                )?;
                let id = self
                    .memory
                    .allocate(Object::summarized(ename, Region::Input, vec![cell]));
                Ok(Location::new(id, 0))
            }

            (Type::Array { .. } | Type::Struct(_), data) => {
                let id = self
                    .memory
                    .allocate(Object::new(name.clone(), Region::Input, Vec::new()));
                let pushed = if let Type::Struct(s) = pointee {
                    self.ancestors.push((s.clone(), id));
                    true
                } else {
                    false
                };
                let mut cells = Vec::new();
                let res = self.cells(pointee, data, &name, inner, &mut cells);
                if pushed {
                    self.ancestors.pop();
                }
                res?;
                self.memory
                    .set_cells(id, cells)
                    .map_err(|e| crate::ir::Error(e.to_string()))?;
                Ok(Location::new(id, 0))
            }
        }
    }

    /// Append the leaves of a value of type `ty` to `out`.
    fn cells(
        &mut self,
        ty: &Type,
        data: &Abstract,
        place: &str,
        ctx: Ctx,
        out: &mut Vec<Value>,
    ) -> Result<(), SpecError> {
        match ty {
            Type::Void => {
                out.push(Value::Unknown(ctx.taint(place)));
                Ok(())
            }
            Type::Int { .. } | Type::Pointer(_) => {
                out.push(self.value(ty, data, place, ctx)?);
                Ok(())
            }
            Type::Array { element, len } => {
                let eplace = element_place(place);
                match data {
                    Abstract::Array {
                        element: edata,
                        len: dlen,
                    } if dlen == len => {
                        for _ in 0..*len {
                            self.cells(element, edata, &eplace, ctx, out)?;
                        }
                        Ok(())
                    }
                    Abstract::Default | Abstract::Secret => {
                        for _ in 0..*len {
                            self.cells(element, data, &eplace, ctx, out)?;
                        }
                        Ok(())
                    }
                    data => Err(Self::mismatch(place, data, ty)),
                }
            }
            Type::Struct(name) => {
                let def = self
                    .module
                    .structs
                    .get(name)
                    .ok_or_else(|| crate::ir::Error(format!("Unknown struct: %{}", name)))?;
                let fields = &def.fields;
                match data {
                    Abstract::Struct(ds) => {
                        if ds.len() != fields.len() {
                            return Err(SpecError::FieldCount {
                                place: place.to_string(),
                                name: name.clone(),
                                expected: fields.len(),
                                got: ds.len(),
                            });
                        }
                        for (f, d) in fields.iter().zip(ds.iter()) {
                            self.cells(&f.ty, d, &field_place(place, &f.name), ctx, out)?;
                        }
                        Ok(())
                    }
                    Abstract::Fields(ds) => {
                        if let Some(unknown) = ds.keys().find(|k| def.field_index(k).is_none()) {
                            return Err(SpecError::UnknownField {
                                place: place.to_string(),
                                name: name.clone(),
                                field: unknown.clone(),
                            });
                        }
                        let default = Abstract::Default;
                        for f in fields {
                            let d = ds.get(&f.name).unwrap_or(&default);
                            self.cells(&f.ty, d, &field_place(place, &f.name), ctx, out)?;
                        }
                        Ok(())
                    }
                    Abstract::Default if !ctx.secret => match self.struct_description(name) {
                        Some(d) => self.cells(ty, d, place, ctx, out),
                        None => {
                            for f in fields {
                                let fp = field_place(place, &f.name);
                                self.cells(&f.ty, &Abstract::Default, &fp, ctx, out)?;
                            }
                            Ok(())
                        }
                    },
                    Abstract::Default | Abstract::Secret => {
                        for f in fields {
                            let fp = field_place(place, &f.name);
                            self.cells(&f.ty, data, &fp, ctx, out)?;
                        }
                        Ok(())
                    }
                    data => Err(Self::mismatch(place, data, ty)),
                }
            }
        }
    }
}
