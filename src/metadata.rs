//! Static class metadata emitted by the ahead-of-time translator.
//!
//! Everything in this module is read-only at runtime: the translator emits one
//! `ClassInfo` literal per Java class (appended to the registry slice handed
//! to the VM), one Rust function per method body, and the pre-resolved field
//! tables whose byte offsets already account for superclass layout.

use crate::object::prelude::*;
use crate::thread::ThreadPtr;

pub type ClassInfoRef = &'static ClassInfo;
pub type ClassRegistry = &'static [ClassInfoRef];

pub const CLASS_ACC_PUBLIC: u16 = 0x0001;
pub const CLASS_ACC_FINAL: u16 = 0x0010;
pub const CLASS_ACC_SUPER: u16 = 0x0020;
pub const CLASS_ACC_INTERFACE: u16 = 0x0200;
pub const CLASS_ACC_ABSTRACT: u16 = 0x0400;

pub const FIELD_ACC_STATIC: u16 = 0x0008;
pub const FIELD_ACC_FINAL: u16 = 0x0010;

pub const METHOD_ACC_PUBLIC: u16 = 0x0001;
pub const METHOD_ACC_STATIC: u16 = 0x0008;
pub const METHOD_ACC_NATIVE: u16 = 0x0100;
pub const METHOD_ACC_ABSTRACT: u16 = 0x0400;

/// JVM computational types plus the reference/array split used by array
/// element accessors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BasicType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
    Object,
    Array,
    Void,
}

impl BasicType {
    pub fn size(self) -> usize {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Float | BasicType::Int => 4,
            BasicType::Double | BasicType::Long => 8,
            BasicType::Object | BasicType::Array => std::mem::size_of::<ObjectPtr>(),
            BasicType::Void => 0,
        }
    }

    pub fn from_descriptor(d: u8) -> Option<BasicType> {
        match d {
            b'Z' => Some(BasicType::Boolean),
            b'C' => Some(BasicType::Char),
            b'F' => Some(BasicType::Float),
            b'D' => Some(BasicType::Double),
            b'B' => Some(BasicType::Byte),
            b'S' => Some(BasicType::Short),
            b'I' => Some(BasicType::Int),
            b'J' => Some(BasicType::Long),
            b'V' => Some(BasicType::Void),
            b'L' => Some(BasicType::Object),
            b'[' => Some(BasicType::Array),
            _ => None,
        }
    }

    pub fn is_subword(self) -> bool {
        matches!(
            self,
            BasicType::Boolean | BasicType::Char | BasicType::Byte | BasicType::Short
        )
    }
}

/// A translated method body. Generated functions take the current thread
/// context as their only Rust-level argument; Java arguments travel on the
/// caller's operand stack.
#[derive(Clone, Copy)]
pub enum MethodRoutine {
    Void(fn(ThreadPtr)),
    Boolean(fn(ThreadPtr) -> JBoolean),
    Byte(fn(ThreadPtr) -> JByte),
    Char(fn(ThreadPtr) -> JChar),
    Short(fn(ThreadPtr) -> JShort),
    Int(fn(ThreadPtr) -> JInt),
    Long(fn(ThreadPtr) -> JLong),
    Float(fn(ThreadPtr) -> JFloat),
    Double(fn(ThreadPtr) -> JDouble),
    Object(fn(ThreadPtr) -> ObjectPtr),
}

/// Mangled symbol names for a native method, looked up short-name first.
pub struct NativeNames {
    pub short_name: &'static str,
    pub long_name: &'static str,
}

pub struct FieldInfo {
    pub access_flags: u16,
    pub name: &'static str,
    pub descriptor: &'static str,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.access_flags & FIELD_ACC_STATIC != 0
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.descriptor.as_bytes()[0], b'L' | b'[')
    }

    pub fn basic_type(&self) -> BasicType {
        BasicType::from_descriptor(self.descriptor.as_bytes()[0]).expect("bad field descriptor")
    }
}

pub struct MethodInfo {
    pub access_flags: u16,
    pub name: &'static str,
    pub descriptor: &'static str,
    pub code: Option<MethodRoutine>,
    pub native: Option<&'static NativeNames>,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.access_flags & METHOD_ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags & METHOD_ACC_NATIVE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & METHOD_ACC_ABSTRACT != 0
    }
}

/// One virtual dispatch slot: the class that supplies the implementation and
/// the implementation itself. `invoke_virtual` indexes this table with the
/// translator-assigned slot number.
pub struct VTableEntry {
    pub declaring: ClassInfoRef,
    pub method: &'static MethodInfo,
}

pub struct ITableMethod {
    pub method_index: u16,
    pub vtable_index: u16,
}

/// Per implemented interface: interface-method-index to vtable-index.
pub struct ITableEntry {
    pub interface: ClassInfoRef,
    pub methods: &'static [ITableMethod],
}

/// Static field storage lives in the class block; offsets are relative to the
/// class block start and were computed by the translator.
pub struct PreResolvedStaticField {
    pub field_index: u16,
    pub offset: usize,
    pub is_reference: bool,
}

/// Instance field tables list ALL fields including inherited ones; offsets
/// are relative to the object start and already account for superclass
/// layout.
pub struct PreResolvedInstanceField {
    pub declaring: Option<ClassInfoRef>,
    pub field_index: u16,
    pub offset: usize,
    pub is_reference: bool,
}

/// Invoked while the class block is being resolved; fills the runtime field
/// tables. The translator references one of the runtime-provided handlers
/// (`classloader::resolve_ordinary`, `classloader::resolve_primitive`).
pub type ResolveHandler = fn(JClassPtr);

pub struct ClassInfo {
    pub access_flags: u16,
    /// Fully qualified internal name, slash separated, leading `[` for
    /// arrays.
    pub name: &'static str,
    pub super_class: Option<ClassInfoRef>,
    pub interfaces: &'static [ClassInfoRef],
    pub fields: &'static [FieldInfo],
    pub methods: &'static [MethodInfo],

    pub resolve: ResolveHandler,
    /// Size of the class block including static storage.
    pub class_size: usize,
    /// Size of an instance including the object header.
    pub instance_size: usize,

    pub static_fields: &'static [PreResolvedStaticField],
    pub instance_fields: &'static [PreResolvedInstanceField],

    pub vtable: &'static [VTableEntry],
    pub itable: &'static [ITableEntry],

    pub clinit: Option<fn(ThreadPtr)>,
    pub finalizer: Option<MethodRoutine>,

    /// Component type for synthesized array classes, `None` otherwise.
    pub element: Option<ClassInfoRef>,
}

impl ClassInfo {
    pub fn is_interface(&self) -> bool {
        self.access_flags & CLASS_ACC_INTERFACE != 0
    }

    pub fn is_array(&self) -> bool {
        self.name.as_bytes()[0] == b'['
    }

    pub fn is_primitive(&self) -> bool {
        self.name.len() == 1 && BasicType::from_descriptor(self.name.as_bytes()[0]).is_some()
    }

    pub fn element_type(&self) -> BasicType {
        debug_assert!(self.is_array());
        BasicType::from_descriptor(self.name.as_bytes()[1]).expect("bad array descriptor")
    }

    /// Pointer identity is how infos are compared everywhere.
    pub fn same_as(&'static self, other: ClassInfoRef) -> bool {
        std::ptr::eq(self, other)
    }
}

//*********************************************************************************************************
// Primitive class infos, statically linked singletons
//*********************************************************************************************************

macro_rules! def_prim_info {
    ($($ident:ident => $desc:literal),* $(,)?) => {
        paste::paste! {
            $(
                pub static [<PRIM_ $ident>]: ClassInfo = ClassInfo {
                    access_flags: CLASS_ACC_PUBLIC | CLASS_ACC_FINAL | CLASS_ACC_ABSTRACT,
                    name: $desc,
                    super_class: None,
                    interfaces: &[],
                    fields: &[],
                    methods: &[],
                    resolve: crate::classloader::resolve_primitive,
                    class_size: crate::classloader::BASE_CLASS_BLOCK_SIZE,
                    instance_size: 0,
                    static_fields: &[],
                    instance_fields: &[],
                    vtable: &[],
                    itable: &[],
                    clinit: None,
                    finalizer: None,
                    element: None,
                };
            )*

            pub fn primitive_info_by_descriptor(d: u8) -> Option<ClassInfoRef> {
                match d {
                    $( [<$ident _DESC>] => Some(&[<PRIM_ $ident>]), )*
                    _ => None,
                }
            }
        }
    };
}

const Z_DESC: u8 = b'Z';
const B_DESC: u8 = b'B';
const C_DESC: u8 = b'C';
const S_DESC: u8 = b'S';
const I_DESC: u8 = b'I';
const J_DESC: u8 = b'J';
const F_DESC: u8 = b'F';
const D_DESC: u8 = b'D';
const V_DESC: u8 = b'V';

def_prim_info!(
    Z => "Z",
    B => "B",
    C => "C",
    S => "S",
    I => "I",
    J => "J",
    F => "F",
    D => "D",
    V => "V",
);

pub fn primitive_by_name(name: &str) -> Option<ClassInfoRef> {
    let d = match name {
        "boolean" => b'Z',
        "byte" => b'B',
        "char" => b'C',
        "short" => b'S',
        "int" => b'I',
        "long" => b'J',
        "float" => b'F',
        "double" => b'D',
        "void" => b'V',
        _ => return None,
    };
    primitive_info_by_descriptor(d)
}

//*********************************************************************************************************
// Descriptor walking
//*********************************************************************************************************

/// Returns the return-type portion of a method descriptor.
pub fn return_type(desc: &str) -> &str {
    let close = desc.find(')').expect("bad method descriptor");
    &desc[close + 1..]
}

/// Iterate the parameter descriptors of a method descriptor.
pub fn parameter_types(desc: &str) -> ParameterTypes<'_> {
    debug_assert!(desc.as_bytes()[0] == b'(');
    ParameterTypes {
        rest: &desc[1..desc.find(')').expect("bad method descriptor")],
    }
}

pub struct ParameterTypes<'a> {
    rest: &'a str,
}

impl<'a> Iterator for ParameterTypes<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        let bytes = self.rest.as_bytes();
        let mut end = 0;
        while bytes[end] == b'[' {
            end += 1;
        }
        if bytes[end] == b'L' {
            while bytes[end] != b';' {
                end += 1;
            }
        }
        end += 1;
        let (head, tail) = self.rest.split_at(end);
        self.rest = tail;
        return Some(head);
    }
}

pub fn parameter_count(desc: &str) -> usize {
    parameter_types(desc).count()
}

/// Number of operand slots the parameters occupy, counting long/double as 2.
/// Does not include the receiver.
pub fn parameter_slots(desc: &str) -> usize {
    parameter_types(desc)
        .map(|p| match p.as_bytes()[0] {
            b'J' | b'D' => 2,
            _ => 1,
        })
        .sum()
}

/// "[[La/b/C;" -> "a.b.C[][]", "[[B" -> "byte[][]". Used for exception
/// messages.
pub fn pretty_descriptor(descriptor: &str) -> String {
    let bytes = descriptor.as_bytes();
    let mut dim = 0;
    while dim < bytes.len() && bytes[dim] == b'[' {
        dim += 1;
    }
    let base = &descriptor[dim..];
    let mut result = if base.as_bytes().first() == Some(&b'L') {
        base[1..base.len() - 1].replace('/', ".")
    } else {
        match base.as_bytes().first() {
            Some(b'Z') => "boolean".to_string(),
            Some(b'B') => "byte".to_string(),
            Some(b'C') => "char".to_string(),
            Some(b'S') => "short".to_string(),
            Some(b'I') => "int".to_string(),
            Some(b'J') => "long".to_string(),
            Some(b'F') => "float".to_string(),
            Some(b'D') => "double".to_string(),
            Some(b'V') => "void".to_string(),
            _ => base.replace('/', "."),
        }
    };
    for _ in 0..dim {
        result.push_str("[]");
    }
    return result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_walking() {
        let desc = "(ILjava/lang/String;[[Ljava/lang/Object;DJ)V";
        let params: Vec<&str> = parameter_types(desc).collect();
        assert_eq!(
            params,
            vec!["I", "Ljava/lang/String;", "[[Ljava/lang/Object;", "D", "J"]
        );
        assert_eq!(parameter_count(desc), 5);
        assert_eq!(parameter_slots(desc), 7);
        assert_eq!(return_type(desc), "V");
    }

    #[test]
    fn pretty_names() {
        assert_eq!(pretty_descriptor("[[La/b/C;"), "a.b.C[][]");
        assert_eq!(pretty_descriptor("[[B"), "byte[][]");
        assert_eq!(pretty_descriptor("I"), "int");
    }

    #[test]
    fn primitive_singletons() {
        assert!(PRIM_I.is_primitive());
        assert!(primitive_by_name("int").unwrap().same_as(&PRIM_I));
        assert!(primitive_info_by_descriptor(b'J').unwrap().same_as(&PRIM_J));
        assert!(primitive_by_name("foo").is_none());
    }
}
