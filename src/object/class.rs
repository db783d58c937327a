use super::prelude::*;
use super::ObjectHeader;
use crate::memory::{align_size_up, SIZE_ALIGNMENT};
use crate::metadata::{ClassInfo, ClassInfoRef, FieldInfo};

pub type JClassPtr = Ptr<JClass>;

/// Class lifecycle states. Monotonic except `Initializing -> Error`;
/// `Initialized` requires every superclass and superinterface to be
/// `Initialized` first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u32)]
pub enum ClassState {
    Allocated = 0,
    Registered,
    Resolved,
    Initializing,
    Initialized,
    Error,
}

/// A field with its runtime byte offset: relative to the object start for
/// instance fields, relative to the class block start for statics.
pub struct ResolvedField {
    pub info: Ptr<FieldInfo>,
    pub offset: usize,
    pub is_reference: bool,
    pub is_static: bool,
}

impl ResolvedField {
    pub fn matches(&self, name: &str, desc: &str) -> bool {
        self.info.name == name && self.info.descriptor == desc
    }
}

/// Runtime class block. Lives at a stable address in the large-object region;
/// static field storage follows at `STATICS_OFFSET`. The class word of the
/// embedded header stays null, which is how the GC tells a class block from
/// an ordinary object.
#[repr(C)]
pub struct JClass {
    header: ObjectHeader,

    pub state: ClassState,
    pub info: Ptr<ClassInfo>,

    pub class_loader: ObjectPtr,
    /// The canonical java/lang/Class instance, allocated contiguously after
    /// this block.
    pub class_instance: ObjectPtr,

    pub super_class: JClassPtr,
    pub interface_count: u32,
    pub interfaces: Ptr<JClassPtr>,

    pub static_count: u32,
    pub statics: Ptr<ResolvedField>,
    pub has_static_reference: bool,

    pub field_count: u32,
    pub fields: Ptr<ResolvedField>,
    pub has_reference: bool,

    /// Thread currently running `<clinit>`, for the recursive-init check.
    pub init_thread: JLong,
}

impl JClass {
    pub const STATICS_OFFSET: usize = align_size_up(std::mem::size_of::<JClass>(), SIZE_ALIGNMENT);

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn is_interface(&self) -> bool {
        self.info.is_interface()
    }

    pub fn is_array(&self) -> bool {
        self.info.is_array()
    }

    pub fn is_primitive(&self) -> bool {
        self.info.is_primitive()
    }

    pub fn as_object(clazz: JClassPtr) -> ObjectPtr {
        clazz.cast()
    }

    pub fn interfaces_slice(&self) -> &'static [JClassPtr] {
        if self.interface_count == 0 {
            return &[];
        }
        self.interfaces.as_slice(self.interface_count as usize)
    }

    pub fn statics_slice(&self) -> &'static [ResolvedField] {
        if self.static_count == 0 {
            return &[];
        }
        self.statics.as_slice(self.static_count as usize)
    }

    pub fn fields_slice(&self) -> &'static [ResolvedField] {
        if self.field_count == 0 {
            return &[];
        }
        self.fields.as_slice(self.field_count as usize)
    }

    /// Read a static reference at a class-block-relative byte offset.
    pub fn read_static_ref(clazz: JClassPtr, offset: usize) -> ObjectPtr {
        let slot: Ptr<ObjectPtr> = clazz.cast::<u8>().offset(offset as isize).cast();
        *slot.as_ref()
    }

    pub fn write_static_ref(clazz: JClassPtr, offset: usize, value: ObjectPtr) {
        let slot: Ptr<ObjectPtr> = clazz.cast::<u8>().offset(offset as isize).cast();
        *slot.as_mut_ref() = value;
    }
}

/// Array classes extend the class block with the component type; their
/// `ClassInfo` is synthesized (and leaked) when the array class is first
/// requested.
#[repr(C)]
pub struct ArrayClass {
    pub base: JClass,
    pub component: JClassPtr,
}

impl ArrayClass {
    pub fn of(clazz: JClassPtr) -> Ptr<ArrayClass> {
        debug_assert!(clazz.is_array());
        clazz.cast()
    }
}

const JAVA_LANG_OBJECT: &str = "java/lang/Object";
const JAVA_LANG_CLONEABLE: &str = "java/lang/Cloneable";
const JAVA_IO_SERIALIZABLE: &str = "java/io/Serializable";

fn assignable_interface(s: ClassInfoRef, t: ClassInfoRef) -> bool {
    if !t.is_interface() {
        return false;
    }
    if s.same_as(t) {
        return true;
    }
    for it in s.interfaces {
        if assignable_interface(*it, t) {
            return true;
        }
    }
    if let Some(sup) = s.super_class {
        return assignable_interface(sup, t);
    }
    return false;
}

/// jvms8 checkcast/instanceof assignability on translator metadata.
pub fn class_assignable(s: ClassInfoRef, t: ClassInfoRef) -> bool {
    if s.same_as(t) || t.name == JAVA_LANG_OBJECT {
        return true;
    }

    if s.is_array() {
        if t.name == JAVA_LANG_CLONEABLE || t.name == JAVA_IO_SERIALIZABLE {
            return true;
        }
        if t.is_array() {
            let (se, te) = (s.element, t.element);
            return match (se, te) {
                (Some(se), Some(te)) => {
                    if se.is_primitive() || te.is_primitive() {
                        se.same_as(te)
                    } else {
                        class_assignable(se, te)
                    }
                }
                _ => false,
            };
        }
        return false;
    }

    if t.is_interface() {
        return assignable_interface(s, t);
    }

    if s.is_interface() {
        // An interface is only assignable to Object or a superinterface,
        // both handled above.
        return false;
    }

    let mut sup = s.super_class;
    while let Some(c) = sup {
        if c.same_as(t) {
            return true;
        }
        sup = c.super_class;
    }
    return false;
}
