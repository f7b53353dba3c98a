// Copyright (c) 2017-2019 Fabian Schuiki

//! Class and function metadata supplied by the runtime.
//!
//! The optimizer never mutates the table while a method is being compiled.
//! It is shared between concurrently optimized methods behind an `Arc`.

use crate::{
    ir::{ClassId, FunctionId},
    table::PrimaryTable,
};
use std::collections::HashMap;

/// Byte offset of the length field of fixed-length arrays.
pub const ARRAY_LENGTH_OFFSET: usize = 8;
/// Byte offset of the backing store of a growable array.
pub const GROWABLE_ARRAY_DATA_OFFSET: usize = 8;
/// Byte offset of the length field of a growable array.
pub const GROWABLE_ARRAY_LENGTH_OFFSET: usize = 16;
/// Byte offset of the length field of strings.
pub const STRING_LENGTH_OFFSET: usize = 8;
/// Byte offset of the length field of typed data.
pub const TYPED_DATA_LENGTH_OFFSET: usize = 8;
/// Size of an object header; the first field follows it.
pub const OBJECT_HEADER_SIZE: usize = 8;

/// The byte offset of the length field of an array-like class.
pub fn length_offset_for(class_id: ClassId) -> Option<usize> {
    match class_id {
        ClassId::GROWABLE_ARRAY => Some(GROWABLE_ARRAY_LENGTH_OFFSET),
        ClassId::ARRAY | ClassId::IMMUTABLE_ARRAY => Some(ARRAY_LENGTH_OFFSET),
        c if c.is_string() => Some(STRING_LENGTH_OFFSET),
        c if c.is_typed_data() => Some(TYPED_DATA_LENGTH_OFFSET),
        _ => None,
    }
}

/// Core library functions with known semantics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecognizedMethod {
    Unknown,
    ObjectArrayLength,
    ImmutableArrayLength,
    GrowableArrayLength,
    GrowableArrayCapacity,
    ByteArrayBaseLength,
    StringBaseLength,
    StringBaseIsEmpty,
    StringBaseCharCodeAt,
    StringBaseCharAt,
    IntegerToDouble,
    DoubleToInteger,
    DoubleTruncate,
    DoubleRound,
    DoubleFloor,
    DoubleCeil,
    DoubleMod,
    DoublePow,
    MathSqrt,
    MathSin,
    MathCos,
}

impl Default for RecognizedMethod {
    fn default() -> Self {
        RecognizedMethod::Unknown
    }
}

/// A field of a class.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    /// Byte offset of the field within instances.
    pub offset: usize,
    pub is_final: bool,
    /// The only class ever stored into the field, or `ClassId::DYNAMIC`.
    pub guarded_cid: ClassId,
}

/// The flavour of a function.
#[derive(Clone, Debug, PartialEq)]
pub enum FunctionKind {
    Regular,
    Getter,
    Setter,
    ImplicitGetter(FieldInfo),
    ImplicitSetter(FieldInfo),
    Constructor,
}

/// A function known to the runtime.
#[derive(Clone, Debug)]
pub struct FunctionInfo {
    pub name: String,
    pub owner: ClassId,
    pub kind: FunctionKind,
    pub recognized: RecognizedMethod,
    pub is_static: bool,
}

/// A class known to the runtime.
#[derive(Clone, Debug)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
    pub superclass: Option<ClassId>,
    pub fields: Vec<FieldInfo>,
    pub methods: HashMap<String, FunctionId>,
}

/// The class hierarchy and method tables.
#[derive(Clone, Debug)]
pub struct ClassTable {
    classes: HashMap<ClassId, ClassInfo>,
    functions: PrimaryTable<FunctionId, FunctionInfo>,
    next_class_id: u32,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    /// Create a table populated with the core library classes.
    pub fn new() -> Self {
        let mut table = Self {
            classes: HashMap::new(),
            functions: PrimaryTable::new(),
            next_class_id: ClassId::FIRST_USER,
        };
        table.add_core_classes();
        table
    }

    fn add_core_class(&mut self, id: ClassId, superclass: Option<ClassId>) {
        self.classes.insert(
            id,
            ClassInfo {
                id,
                name: format!("{}", id),
                superclass,
                fields: vec![],
                methods: HashMap::new(),
            },
        );
    }

    fn add_core_classes(&mut self) {
        use RecognizedMethod::*;
        let object = Some(ClassId::OBJECT);
        self.add_core_class(ClassId::OBJECT, None);
        self.add_core_class(ClassId::NULL, object);
        self.add_core_class(ClassId::BOOL, object);
        self.add_core_class(ClassId::TYPE, object);
        self.add_core_class(ClassId::TYPE_ARGUMENTS, object);
        self.add_core_class(ClassId::MATH, object);
        self.add_method(ClassId::OBJECT, "==", FunctionKind::Regular, Unknown);

        for &cid in &[ClassId::SMI, ClassId::MINT, ClassId::BIGINT, ClassId::DOUBLE] {
            self.add_core_class(cid, object);
            for op in &["+", "-", "*", "/", "~/", "%", "<", ">", "<=", ">=", "==", "unary-"] {
                self.add_method(cid, op, FunctionKind::Regular, Unknown);
            }
        }
        for &cid in &[ClassId::SMI, ClassId::MINT, ClassId::BIGINT] {
            for op in &["&", "|", "^", "<<", ">>", "~"] {
                self.add_method(cid, op, FunctionKind::Regular, Unknown);
            }
            self.add_method(cid, "toDouble", FunctionKind::Regular, IntegerToDouble);
        }
        let double = ClassId::DOUBLE;
        self.add_method(double, "%", FunctionKind::Regular, DoubleMod);
        self.add_method(double, "pow", FunctionKind::Regular, DoublePow);
        self.add_method(double, "toInt", FunctionKind::Regular, DoubleToInteger);
        self.add_method(double, "truncate", FunctionKind::Regular, DoubleTruncate);
        self.add_method(double, "round", FunctionKind::Regular, DoubleRound);
        self.add_method(double, "floor", FunctionKind::Regular, DoubleFloor);
        self.add_method(double, "ceil", FunctionKind::Regular, DoubleCeil);

        for &cid in &[ClassId::ONE_BYTE_STRING, ClassId::TWO_BYTE_STRING] {
            self.add_core_class(cid, object);
            self.add_method(cid, "get:length", FunctionKind::Getter, StringBaseLength);
            self.add_method(cid, "get:isEmpty", FunctionKind::Getter, StringBaseIsEmpty);
            self.add_method(cid, "charCodeAt", FunctionKind::Regular, StringBaseCharCodeAt);
            self.add_method(cid, "[]", FunctionKind::Regular, StringBaseCharAt);
        }

        let arrays = [
            (ClassId::ARRAY, ObjectArrayLength),
            (ClassId::IMMUTABLE_ARRAY, ImmutableArrayLength),
            (ClassId::GROWABLE_ARRAY, GrowableArrayLength),
        ];
        for &(cid, length) in &arrays {
            self.add_core_class(cid, object);
            self.add_method(cid, "get:length", FunctionKind::Getter, length);
            self.add_method(cid, "[]", FunctionKind::Regular, Unknown);
            self.add_method(cid, "[]=", FunctionKind::Regular, Unknown);
        }
        let new_array = self.add_method(ClassId::ARRAY, "new", FunctionKind::Constructor, Unknown);
        self.functions[new_array].is_static = true;
        self.add_method(
            ClassId::GROWABLE_ARRAY,
            "get:_capacity",
            FunctionKind::Getter,
            GrowableArrayCapacity,
        );
        for id in ClassId::INT8_ARRAY.0..=ClassId::EXTERNAL_UINT8_ARRAY.0 {
            let cid = ClassId(id);
            self.add_core_class(cid, object);
            self.add_method(cid, "get:length", FunctionKind::Getter, ByteArrayBaseLength);
            self.add_method(cid, "[]", FunctionKind::Regular, Unknown);
            self.add_method(cid, "[]=", FunctionKind::Regular, Unknown);
        }

        for &(name, recognized) in &[("sqrt", MathSqrt), ("sin", MathSin), ("cos", MathCos)] {
            let id = self.add_method(ClassId::MATH, name, FunctionKind::Regular, recognized);
            self.functions[id].is_static = true;
        }
    }

    /// Register a new user class.
    pub fn add_class(&mut self, name: impl Into<String>, superclass: Option<ClassId>) -> ClassId {
        let id = ClassId(self.next_class_id);
        self.next_class_id += 1;
        self.classes.insert(
            id,
            ClassInfo {
                id,
                name: name.into(),
                superclass: Some(superclass.unwrap_or(ClassId::OBJECT)),
                fields: vec![],
                methods: HashMap::new(),
            },
        );
        id
    }

    /// Add a field to a class, together with its implicit getter and setter.
    pub fn add_field(
        &mut self,
        class: ClassId,
        name: &str,
        is_final: bool,
        guarded_cid: ClassId,
    ) -> FieldInfo {
        let offset = OBJECT_HEADER_SIZE + 8 * self.instance_field_count(class);
        let field = FieldInfo {
            name: name.to_owned(),
            offset,
            is_final,
            guarded_cid,
        };
        self.class_mut(class).fields.push(field.clone());
        self.add_method(
            class,
            &format!("get:{}", name),
            FunctionKind::ImplicitGetter(field.clone()),
            RecognizedMethod::Unknown,
        );
        if !is_final {
            self.add_method(
                class,
                &format!("set:{}", name),
                FunctionKind::ImplicitSetter(field.clone()),
                RecognizedMethod::Unknown,
            );
        }
        field
    }

    /// Add a method to a class.
    pub fn add_method(
        &mut self,
        class: ClassId,
        name: &str,
        kind: FunctionKind,
        recognized: RecognizedMethod,
    ) -> FunctionId {
        let id = self.functions.add(FunctionInfo {
            name: name.to_owned(),
            owner: class,
            kind,
            recognized,
            is_static: false,
        });
        self.class_mut(class).methods.insert(name.to_owned(), id);
        id
    }

    fn class_mut(&mut self, class: ClassId) -> &mut ClassInfo {
        self.classes.get_mut(&class).expect("class not in table")
    }

    fn instance_field_count(&self, class: ClassId) -> usize {
        self.superclass_chain(class)
            .filter_map(|c| self.classes.get(&c))
            .map(|c| c.fields.len())
            .sum()
    }

    /// Look up a class.
    pub fn class(&self, class: ClassId) -> Option<&ClassInfo> {
        self.classes.get(&class)
    }

    /// Look up a class by its name.
    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes.values().find(|c| c.name == name).map(|c| c.id)
    }

    /// Look up a function.
    pub fn function(&self, id: FunctionId) -> &FunctionInfo {
        &self.functions[id]
    }

    /// Iterate over a class and all its superclasses.
    pub fn superclass_chain<'a>(&'a self, class: ClassId) -> impl Iterator<Item = ClassId> + 'a {
        std::iter::successors(Some(class), move |c| {
            self.classes.get(c).and_then(|info| info.superclass)
        })
    }

    /// Find the method a call with the given selector dispatches to for a
    /// receiver of the given class.
    pub fn resolve_dynamic(&self, receiver: ClassId, name: &str) -> Option<FunctionId> {
        self.superclass_chain(receiver)
            .filter_map(|c| self.classes.get(&c))
            .find_map(|c| c.methods.get(name).cloned())
    }

    /// Look up a static function by class and name.
    pub fn lookup_static(&self, class: ClassId, name: &str) -> Option<FunctionId> {
        self.classes
            .get(&class)
            .and_then(|c| c.methods.get(name).cloned())
            .filter(|&id| self.functions[id].is_static)
    }

    /// Look up a field by name in a class or its superclasses.
    pub fn lookup_field(&self, class: ClassId, name: &str) -> Option<&FieldInfo> {
        self.superclass_chain(class)
            .filter_map(|c| self.classes.get(&c))
            .find_map(|c| c.fields.iter().find(|f| f.name == name))
    }

    /// Check whether any class directly extends the given one.
    pub fn has_subclasses(&self, class: ClassId) -> bool {
        self.classes.values().any(|c| c.superclass == Some(class))
    }

    /// Check whether a subclass of the given class overrides a method.
    pub fn has_override(&self, class: ClassId, name: &str) -> bool {
        let mut pending = vec![class];
        while let Some(c) = pending.pop() {
            for info in self.classes.values().filter(|i| i.superclass == Some(c)) {
                if info.methods.contains_key(name) {
                    return true;
                }
                pending.push(info.id);
            }
        }
        false
    }

    /// Check whether instances of class `sub` are instances of type `sup`.
    ///
    /// Null is not an instance of anything but `Object` and `dynamic`.
    pub fn is_subtype(&self, sub: ClassId, sup: ClassId) -> bool {
        if sup == ClassId::DYNAMIC || sup == ClassId::OBJECT || sub == sup {
            return true;
        }
        match sup {
            ClassId::INT => return sub.is_integer(),
            ClassId::NUM => return sub.is_integer() || sub == ClassId::DOUBLE,
            ClassId::STRING => return sub.is_string(),
            _ => (),
        }
        self.superclass_chain(sub).any(|c| c == sup)
    }

    /// Check whether a value of class `sub` may be assigned to a variable
    /// declared with type `sup`.
    pub fn is_assignable(&self, sub: ClassId, sup: ClassId) -> bool {
        sub == ClassId::NULL || self.is_subtype(sub, sup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_queries_walk_subclasses() {
        let mut table = ClassTable::new();
        let a = table.add_class("A", None);
        let b = table.add_class("B", Some(a));
        let c = table.add_class("C", Some(b));
        table.add_method(a, "foo", FunctionKind::Regular, RecognizedMethod::Unknown);
        table.add_method(c, "foo", FunctionKind::Regular, RecognizedMethod::Unknown);
        assert!(table.has_subclasses(a));
        assert!(!table.has_subclasses(c));
        assert!(table.has_override(a, "foo"));
        assert!(!table.has_override(c, "foo"));
        assert!(!table.has_override(a, "bar"));
        assert!(table.is_subtype(c, a));
        assert!(!table.is_subtype(a, c));
    }

    #[test]
    fn fields_get_accessors() {
        let mut table = ClassTable::new();
        let a = table.add_class("A", None);
        let b = table.add_class("B", Some(a));
        let x = table.add_field(a, "x", false, ClassId::DYNAMIC);
        let y = table.add_field(b, "y", true, ClassId::SMI);
        assert_eq!(x.offset, 8);
        assert_eq!(y.offset, 16);
        let getter = table.resolve_dynamic(b, "get:x").unwrap();
        assert_eq!(table.function(getter).kind, FunctionKind::ImplicitGetter(x));
        assert!(table.resolve_dynamic(b, "set:y").is_none());
        assert_eq!(table.lookup_field(b, "y"), Some(&y));
    }

    #[test]
    fn core_methods_are_recognized() {
        let table = ClassTable::new();
        let len = table.resolve_dynamic(ClassId::ARRAY, "get:length").unwrap();
        assert_eq!(table.function(len).recognized, RecognizedMethod::ObjectArrayLength);
        let sqrt = table.lookup_static(ClassId::MATH, "sqrt").unwrap();
        assert_eq!(table.function(sqrt).recognized, RecognizedMethod::MathSqrt);
        assert!(table.is_subtype(ClassId::SMI, ClassId::NUM));
        assert!(!table.is_subtype(ClassId::NULL, ClassId::INT));
        assert!(table.is_assignable(ClassId::NULL, ClassId::INT));
    }
}
