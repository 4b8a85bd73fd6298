//! Interned constant tables.
//!
//! Every string, type, prototype, field and method referenced by a unit is interned exactly
//! once. A [`PoolBuilder`] collects the references while the unit is walked; [`PoolBuilder::finish`]
//! sorts each table into the order the container requires and freezes it into a [`Pool`],
//! which answers index lookups during code generation and writing.
//!
//! Sort orders:
//!
//! - strings by UTF-16 code units
//! - types by the index of their descriptor string
//! - prototypes by return type index, then parameter type indices
//! - fields by (class, name, type) indices
//! - methods by (class, name, prototype) indices

use std::cmp::Ordering;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    file::mutf8,
    ir::{Op, RopMethod},
    types::{FieldRef, MethodRef, Prototype, TypeId},
    Result,
};

/// Collects constants before their indices are fixed.
#[derive(Debug, Default)]
pub struct PoolBuilder {
    strings: FxHashSet<String>,
    types: FxHashSet<TypeId>,
    protos: FxHashSet<Prototype>,
    fields: FxHashSet<FieldRef>,
    methods: FxHashSet<MethodRef>,
}

impl PoolBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string.
    pub fn add_string(&mut self, value: &str) {
        if !self.strings.contains(value) {
            self.strings.insert(value.to_string());
        }
    }

    /// Interns a type and its descriptor.
    pub fn add_type(&mut self, ty: &TypeId) {
        if self.types.insert(ty.clone()) {
            self.add_string(ty.descriptor());
        }
    }

    /// Interns a prototype, its shorty and its types.
    pub fn add_proto(&mut self, proto: &Prototype) {
        if self.protos.insert(proto.clone()) {
            self.add_string(&proto.shorty());
            self.add_type(&proto.ret);
            for param in &proto.params {
                self.add_type(param);
            }
        }
    }

    /// Interns a field reference with its class, name and type.
    pub fn add_field(&mut self, field: &FieldRef) {
        if self.fields.insert(field.clone()) {
            self.add_type(&field.owner);
            self.add_string(&field.name);
            self.add_type(&field.ty);
        }
    }

    /// Interns a method reference with its class, name and prototype.
    pub fn add_method(&mut self, method: &MethodRef) {
        if self.methods.insert(method.clone()) {
            self.add_type(&method.owner);
            self.add_string(&method.name);
            self.add_proto(&method.proto);
        }
    }

    /// Interns whatever constant an operation refers to.
    pub fn add_op(&mut self, op: &Op) {
        match op {
            Op::ConstString(value) => self.add_string(value),
            Op::ConstClass(ty)
            | Op::CheckCast(ty)
            | Op::InstanceOf(ty)
            | Op::NewInstance(ty)
            | Op::NewArray(ty) => self.add_type(ty),
            Op::IGet(field) | Op::IPut(field) | Op::SGet(field) | Op::SPut(field) => {
                self.add_field(field);
            }
            Op::Invoke(_, method) => self.add_method(method),
            _ => {}
        }
    }

    /// Interns every constant used by a lowered method body, catch types included.
    pub fn add_body(&mut self, method: &RopMethod) {
        for block in &method.blocks {
            for insn in &block.insns {
                self.add_op(&insn.op);
            }
            for catch in &block.catches {
                if let Some(ty) = &catch.ty {
                    self.add_type(ty);
                }
            }
        }
    }

    /// Sorts every table and assigns the final indices.
    #[must_use]
    pub fn finish(self) -> Pool {
        let mut strings: Vec<String> = self.strings.into_iter().collect();
        strings.sort_by(|a, b| mutf8::cmp_utf16(a, b));
        let string_index = index_map(&strings);

        // Descriptor strings are unique per type, so string order is type order.
        let mut types: Vec<TypeId> = self.types.into_iter().collect();
        types.sort_by_key(|ty| string_index[ty.descriptor()]);
        let type_index = index_map(&types);

        let proto_key = |proto: &Prototype| {
            (
                type_index[&proto.ret],
                proto.params.iter().map(|p| type_index[p]).collect::<Vec<_>>(),
            )
        };
        let mut protos: Vec<Prototype> = self.protos.into_iter().collect();
        protos.sort_by_cached_key(proto_key);
        let proto_index = index_map(&protos);

        let mut fields: Vec<FieldRef> = self.fields.into_iter().collect();
        fields.sort_by_key(|f| {
            (
                type_index[&f.owner],
                string_index[f.name.as_str()],
                type_index[&f.ty],
            )
        });
        let field_index = index_map(&fields);

        let mut methods: Vec<MethodRef> = self.methods.into_iter().collect();
        methods.sort_by_key(|m| {
            (
                type_index[&m.owner],
                string_index[m.name.as_str()],
                proto_index[&m.proto],
            )
        });
        let method_index = index_map(&methods);

        Pool {
            strings,
            types,
            protos,
            fields,
            methods,
            string_index,
            type_index,
            proto_index,
            field_index,
            method_index,
        }
    }
}

fn index_map<T: Clone + Eq + std::hash::Hash>(items: &[T]) -> FxHashMap<T, u32> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.clone(), i as u32))
        .collect()
}

/// Frozen constant tables with index lookup.
#[derive(Debug, Clone, Default)]
pub struct Pool {
    strings: Vec<String>,
    types: Vec<TypeId>,
    protos: Vec<Prototype>,
    fields: Vec<FieldRef>,
    methods: Vec<MethodRef>,
    string_index: FxHashMap<String, u32>,
    type_index: FxHashMap<TypeId, u32>,
    proto_index: FxHashMap<Prototype, u32>,
    field_index: FxHashMap<FieldRef, u32>,
    method_index: FxHashMap<MethodRef, u32>,
}

impl Pool {
    /// Builds a pool from already ordered tables, as read back from a container.
    #[must_use]
    pub fn from_tables(
        strings: Vec<String>,
        types: Vec<TypeId>,
        protos: Vec<Prototype>,
        fields: Vec<FieldRef>,
        methods: Vec<MethodRef>,
    ) -> Self {
        Pool {
            string_index: index_map(&strings),
            type_index: index_map(&types),
            proto_index: index_map(&protos),
            field_index: index_map(&fields),
            method_index: index_map(&methods),
            strings,
            types,
            protos,
            fields,
            methods,
        }
    }

    /// String table.
    #[must_use]
    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    /// Type table.
    #[must_use]
    pub fn types(&self) -> &[TypeId] {
        &self.types
    }

    /// Prototype table.
    #[must_use]
    pub fn protos(&self) -> &[Prototype] {
        &self.protos
    }

    /// Field table.
    #[must_use]
    pub fn fields(&self) -> &[FieldRef] {
        &self.fields
    }

    /// Method table.
    #[must_use]
    pub fn methods(&self) -> &[MethodRef] {
        &self.methods
    }

    /// Index of an interned string.
    ///
    /// # Errors
    /// Returns [`crate::Error::Encoding`] if the string was never interned.
    pub fn string(&self, value: &str) -> Result<u32> {
        self.string_index
            .get(value)
            .copied()
            .ok_or_else(|| encoding_error!("string {:?} not in pool", value))
    }

    /// Index of an interned type.
    ///
    /// # Errors
    /// Returns [`crate::Error::Encoding`] if the type was never interned.
    pub fn type_id(&self, ty: &TypeId) -> Result<u32> {
        self.type_index
            .get(ty)
            .copied()
            .ok_or_else(|| encoding_error!("type {} not in pool", ty))
    }

    /// Index of an interned prototype.
    ///
    /// # Errors
    /// Returns [`crate::Error::Encoding`] if the prototype was never interned.
    pub fn proto(&self, proto: &Prototype) -> Result<u32> {
        self.proto_index
            .get(proto)
            .copied()
            .ok_or_else(|| encoding_error!("prototype {} not in pool", proto))
    }

    /// Index of an interned field.
    ///
    /// # Errors
    /// Returns [`crate::Error::Encoding`] if the field was never interned.
    pub fn field(&self, field: &FieldRef) -> Result<u32> {
        self.field_index
            .get(field)
            .copied()
            .ok_or_else(|| encoding_error!("field {} not in pool", field))
    }

    /// Index of an interned method.
    ///
    /// # Errors
    /// Returns [`crate::Error::Encoding`] if the method was never interned.
    pub fn method(&self, method: &MethodRef) -> Result<u32> {
        self.method_index
            .get(method)
            .copied()
            .ok_or_else(|| encoding_error!("method {} not in pool", method))
    }

    /// Checks the ordering rules of every table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] naming the first table out of order.
    pub fn validate_order(&self) -> Result<()> {
        let sorted = |ordering: Ordering| ordering == Ordering::Less;
        if !self
            .strings
            .windows(2)
            .all(|w| sorted(mutf8::cmp_utf16(&w[0], &w[1])))
        {
            return Err(malformed_error!("string table is not sorted"));
        }
        let type_key = |ty: &TypeId| self.string_index.get(ty.descriptor()).copied();
        if !self.types.windows(2).all(|w| type_key(&w[0]) < type_key(&w[1])) {
            return Err(malformed_error!("type table is not sorted"));
        }
        let proto_key = |p: &Prototype| {
            (
                self.type_index.get(&p.ret).copied(),
                p.params
                    .iter()
                    .map(|t| self.type_index.get(t).copied())
                    .collect::<Vec<_>>(),
            )
        };
        if !self.protos.windows(2).all(|w| proto_key(&w[0]) < proto_key(&w[1])) {
            return Err(malformed_error!("prototype table is not sorted"));
        }
        let field_key = |f: &FieldRef| {
            (
                self.type_index.get(&f.owner).copied(),
                self.string_index.get(f.name.as_str()).copied(),
                self.type_index.get(&f.ty).copied(),
            )
        };
        if !self.fields.windows(2).all(|w| field_key(&w[0]) < field_key(&w[1])) {
            return Err(malformed_error!("field table is not sorted"));
        }
        let method_key = |m: &MethodRef| {
            (
                self.type_index.get(&m.owner).copied(),
                self.string_index.get(m.name.as_str()).copied(),
                self.proto_index.get(&m.proto).copied(),
            )
        };
        if !self.methods.windows(2).all(|w| method_key(&w[0]) < method_key(&w[1])) {
            return Err(malformed_error!("method table is not sorted"));
        }
        Ok(())
    }
}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        self.strings == other.strings
            && self.types == other.types
            && self.protos == other.protos
            && self.fields == other.fields
            && self.methods == other.methods
    }
}

impl Eq for Pool {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Pool {
        let owner = TypeId::class("z/Gen");
        let mut builder = PoolBuilder::new();
        builder.add_method(&MethodRef::new(
            owner.clone(),
            "hook",
            TypeId::Int,
            vec![TypeId::Long, TypeId::object()],
        ));
        builder.add_method(&MethodRef::new(owner.clone(), "backup", TypeId::Int, vec![]));
        builder.add_field(&FieldRef::new(owner.clone(), "member", TypeId::object()));
        builder.add_op(&Op::ConstString("\u{e9}t\u{e9}".to_string()));
        builder.add_op(&Op::NewInstance(TypeId::class("a/Box")));
        builder.finish()
    }

    #[test]
    fn test_tables_are_sorted_and_deduplicated() {
        let pool = sample();
        pool.validate_order().unwrap();
        assert_eq!(
            pool.types()
                .iter()
                .map(TypeId::descriptor)
                .collect::<Vec<_>>(),
            vec!["I", "J", "La/Box;", "Ljava/lang/Object;", "Lz/Gen;"]
        );
        // "I" is both a shorty and a descriptor.
        assert_eq!(pool.strings().iter().filter(|s| *s == "I").count(), 1);
        assert_eq!(pool.methods()[0].name, "backup");
        assert_eq!(pool.protos()[0].params, Vec::<TypeId>::new());
    }

    #[test]
    fn test_lookups() {
        let pool = sample();
        let gen = TypeId::class("z/Gen");
        let index = pool.type_id(&gen).unwrap();
        assert_eq!(pool.types()[index as usize], gen);
        assert!(pool.type_id(&TypeId::Double).is_err());
        assert!(pool.string("missing").is_err());

        let copy = Pool::from_tables(
            pool.strings().to_vec(),
            pool.types().to_vec(),
            pool.protos().to_vec(),
            pool.fields().to_vec(),
            pool.methods().to_vec(),
        );
        assert_eq!(copy, pool);
        assert_eq!(copy.string("hook").unwrap(), pool.string("hook").unwrap());
    }

    #[test]
    fn test_unsorted_tables_are_rejected() {
        let pool = Pool::from_tables(
            vec!["b".into(), "a".into()],
            vec![],
            vec![],
            vec![],
            vec![],
        );
        assert!(pool.validate_order().is_err());
    }
}
