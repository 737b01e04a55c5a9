use crate::FxIndexMap;
use elsa::FrozenIndexSet;
use std::cell::Cell;
use std::convert::TryInto;
use std::hash::Hash;

/// Context object with global resources for the IR.
///
/// Those resources currently are:
/// * interners, for anything without an identity, and which can be deduplicated
///   (strings, types and constants)
/// * "entity" allocators, for everything else - i.e. anything with an identity
///   that needs to remain unique across an entire `Context`
///   * the *definition* of an entity isn't kept in the `Context`, but rather in
///     some `EntityDefs` collection somewhere in a `Module` (or further nested),
///     with only the entity *indices* being allocated by the `Context`
///
/// Several `Module`s (e.g. shaders and the runtime library they call into) can
/// share one `Context` through `Rc`, which lets them exchange `Type`s directly.
pub struct Context {
    interners: Interners,
    entity_allocs: EntityAllocs,
}

/// Dispatch helper, to allow implementing interning logic on
/// the type passed to `cx.intern(...)`.
pub trait InternInCx {
    type Interned;

    fn intern_in_cx(self, cx: &Context) -> Self::Interned;
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Context {
            interners: Interners::default(),
            entity_allocs: EntityAllocs::default(),
        }
    }

    pub fn intern<T: InternInCx>(&self, x: T) -> T::Interned {
        x.intern_in_cx(self)
    }
}

/// Collection holding the actual definitions for `Context`-allocated entities.
///
/// The only `E` (entity) and `D` (entity definition) type combinations allowed
/// are the ones declared by the `entities!` macro below.
///
/// Unlike the interners, definitions can be removed again (e.g. erasing an
/// instruction), and iteration follows definition order, which keeps every
/// pass deterministic.
pub struct EntityDefs<E, D> {
    map: FxIndexMap<E, D>,
}

impl<E, D> Default for EntityDefs<E, D> {
    fn default() -> Self {
        Self {
            map: FxIndexMap::default(),
        }
    }
}

impl<E: Copy + Eq + Hash, D> EntityDefs<E, D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, entity: E) -> bool {
        self.map.contains_key(&entity)
    }

    pub fn get(&self, entity: E) -> Option<&D> {
        self.map.get(&entity)
    }

    pub fn get_mut(&mut self, entity: E) -> Option<&mut D> {
        self.map.get_mut(&entity)
    }

    /// Remove the definition of `entity`, returning it (the entity index itself
    /// is never reused, as the `Context` only ever allocates fresh ones).
    pub fn remove(&mut self, entity: E) -> Option<D> {
        self.map.shift_remove(&entity)
    }

    pub fn keys(&self) -> impl ExactSizeIterator<Item = E> + '_ {
        self.map.keys().copied()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (E, &D)> + '_ {
        self.map.iter().map(|(&e, d)| (e, d))
    }

    pub fn iter_mut(&mut self) -> impl ExactSizeIterator<Item = (E, &mut D)> + '_ {
        self.map.iter_mut().map(|(&e, d)| (e, d))
    }

    // NOTE: `define` and the `Index`/`IndexMut` impls come from `entities!` below.
}

struct Interner<T: ?Sized>(FrozenIndexSet<Box<T>>);

impl<T: ?Sized + Eq + Hash> Default for Interner<T> {
    fn default() -> Self {
        Self(FrozenIndexSet::new())
    }
}

impl<T: ?Sized + Eq + Hash> Interner<T> {
    #[track_caller]
    fn intern(&self, value: impl AsRef<T> + Into<Box<T>>) -> u32 {
        if let Some((i, _)) = self.0.get_full(value.as_ref()) {
            return i as u32;
        }
        let (i, _) = self.0.insert_full(value.into());
        i.try_into().expect("interner overflowed u32")
    }
}

macro_rules! interners {
    (
        needs_as_ref { $($needs_as_ref_ty:ty),* $(,)? }
        $($name:ident => $ty:ty),+ $(,)?
    ) => {
        $(impl AsRef<Self> for $needs_as_ref_ty {
            fn as_ref(&self) -> &Self {
                self
            }
        })*

        #[allow(non_snake_case)]
        #[derive(Default)]
        struct Interners {
            $($name: Interner<$ty>),*
        }

        $(
            // NOTE: never derive `PartialOrd, Ord` for these types, as
            // observing the interning order shouldn't be allowed.
            #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
            pub struct $name(u32);

            impl std::ops::Index<$name> for Context {
                type Output = $ty;

                fn index(&self, interned: $name) -> &Self::Output {
                    &self.interners.$name.0[interned.0 as usize]
                }
            }
        )*
    };
}

interners! {
    needs_as_ref {
        crate::TypeKind,
        crate::ConstDef,
    }

    InternedStr => str,
    Type => crate::TypeKind,
    Const => crate::ConstDef,
}

impl InternInCx for &'_ str {
    type Interned = InternedStr;

    fn intern_in_cx(self, cx: &Context) -> InternedStr {
        InternedStr(cx.interners.InternedStr.intern(self))
    }
}

impl InternInCx for String {
    type Interned = InternedStr;

    fn intern_in_cx(self, cx: &Context) -> InternedStr {
        InternedStr(cx.interners.InternedStr.intern(self))
    }
}

impl InternInCx for crate::TypeKind {
    type Interned = Type;

    fn intern_in_cx(self, cx: &Context) -> Self::Interned {
        Type(cx.interners.Type.intern(self))
    }
}

impl InternInCx for crate::ConstDef {
    type Interned = Const;

    fn intern_in_cx(self, cx: &Context) -> Self::Interned {
        Const(cx.interners.Const.intern(self))
    }
}

macro_rules! entities {
    (
        $($name:ident => $def:ty),+ $(,)?
    ) => {
        #[allow(non_snake_case)]
        #[derive(Default)]
        struct EntityAllocs {
            $($name: Cell<u32>),*
        }

        $(
            // NOTE: never derive `PartialOrd, Ord` for these types, as
            // observing the entity index allocation order shouldn't be allowed.
            #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
            pub struct $name(u32);

            impl EntityDefs<$name, $def> {
                pub fn define(&mut self, cx: &Context, def: $def) -> $name {
                    let idx = $name(cx.entity_allocs.$name.get());
                    let next_idx = idx.0.checked_add(1).expect("entity index overflowed u32");
                    cx.entity_allocs.$name.set(next_idx);

                    assert!(self.map.insert(idx, def).is_none());

                    idx
                }
            }

            impl std::ops::Index<$name> for EntityDefs<$name, $def> {
                type Output = $def;

                #[track_caller]
                fn index(&self, idx: $name) -> &Self::Output {
                    &self.map[&idx]
                }
            }

            impl std::ops::IndexMut<$name> for EntityDefs<$name, $def> {
                #[track_caller]
                fn index_mut(&mut self, idx: $name) -> &mut Self::Output {
                    self.map.get_mut(&idx).unwrap()
                }
            }
        )*
    };
}

entities! {
    GlobalVar => crate::GlobalVarDecl,
    Func => crate::FuncDecl,
    Block => crate::BlockDef,
    DataInst => crate::DataInstDef,
}
