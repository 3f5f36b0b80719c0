//! User-defined type registry (§3 "User-defined types (UDTs)").

use arcstr::ArcStr;
use indexmap::IndexMap;

/// The declared type of a UDT member, used to pick its zero value on
/// instantiation (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclaredType {
    Integer,
    Number,
    StringT,
    Bool,
    Map,
    DateTime,
    /// Another UDT by name, or an unconstrained member (defaults to 0).
    Named(ArcStr),
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub name: ArcStr,
    pub declared_type: DeclaredType,
}

#[derive(Debug, Clone, Default)]
pub struct TypeInfo {
    pub name: ArcStr,
    pub members: IndexMap<ArcStr, MemberInfo>,
    /// Short method names; the compiler stores the actual bodies in the
    /// function table under the mangled key `TYPE_NAME.METHOD_NAME`.
    pub methods: IndexMap<ArcStr, ArcStr>,
}

impl TypeInfo {
    pub fn new(name: impl Into<ArcStr>) -> Self {
        Self { name: name.into(), members: IndexMap::new(), methods: IndexMap::new() }
    }

    pub fn mangled_method(&self, short_name: &str) -> ArcStr {
        ArcStr::from(format!("{}.{}", self.name, short_name))
    }
}

/// The compiler's type registry, populated by Pass 0 (§4.4).
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: IndexMap<ArcStr, TypeInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: TypeInfo) {
        self.types.insert(info.name.clone(), info);
    }

    pub fn get(&self, name: &str) -> Option<&TypeInfo> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mangles_method_names() {
        let mut t = TypeInfo::new("Point");
        t.methods.insert(ArcStr::from("Dist"), ArcStr::from("Point.Dist"));
        assert_eq!(t.mangled_method("Dist").as_str(), "Point.Dist");
    }
}
