//! The bootstrap class loader and the class lifecycle state machine.
//!
//! Classes whose bytecode was compiled into the binary are owned by the
//! bootstrap loader, identified everywhere by a null classloader reference.
//! Loading is recursive under one global loader monitor; initialization
//! follows jvms8 5.5 on the per-class monitor.

use crate::exception;
use crate::memory::align_size_up;
use crate::memory::heap::Heap;
use crate::memory::SIZE_ALIGNMENT;
use crate::metadata::{
    primitive_info_by_descriptor, ClassInfo, ClassInfoRef, MethodInfo, CLASS_ACC_FINAL,
    CLASS_ACC_PUBLIC,
};
use crate::monitor::{self, MonitorPtr};
use crate::object::class::ArrayClass;
use crate::object::prelude::*;
use crate::object::Object;
use crate::rt;
use crate::thread::{ThreadPtr, ThreadResult};
use std::collections::HashMap;

pub const BASE_CLASS_BLOCK_SIZE: usize = JClass::STATICS_OFFSET;

pub struct BootstrapClassLoader {
    lock: MonitorPtr,
    registry: Vec<ClassInfoRef>,
    classes: HashMap<usize, JClassPtr>,
    array_classes: HashMap<String, JClassPtr>,

    class_info_class: Option<ClassInfoRef>,
    object_class: JClassPtr,
    class_class: JClassPtr,
    string_class: JClassPtr,
}

impl BootstrapClassLoader {
    pub fn new(registry: Vec<ClassInfoRef>) -> BootstrapClassLoader {
        BootstrapClassLoader {
            lock: monitor::create_raw(),
            registry,
            classes: HashMap::new(),
            array_classes: HashMap::new(),
            class_info_class: None,
            object_class: JClassPtr::null(),
            class_class: JClassPtr::null(),
            string_class: JClassPtr::null(),
        }
    }

    pub fn object_class(&self) -> JClassPtr {
        self.object_class
    }

    pub fn class_class(&self) -> JClassPtr {
        self.class_class
    }

    pub fn string_class(&self) -> JClassPtr {
        self.string_class
    }

    /// Linear scan of the translator-produced registry.
    pub fn lookup_info(&self, name: &str) -> Option<ClassInfoRef> {
        self.registry.iter().copied().find(|info| info.name == name)
    }

    pub fn get_loaded(&self, info: ClassInfoRef) -> JClassPtr {
        self.classes
            .get(&(info as *const ClassInfo as usize))
            .copied()
            .unwrap_or(JClassPtr::null())
    }

    pub fn each_class<F: FnMut(JClassPtr)>(&self, mut f: F) {
        for clazz in self.classes.values() {
            if clazz.is_not_null() {
                f(*clazz);
            }
        }
    }

    /// Load the essential classes and back-patch the Class/class-instance
    /// cycle: every class block and its java/lang/Class instance are created
    /// first, then all instances get their class word fixed once
    /// java/lang/Class itself exists.
    pub fn bootstrap(&mut self, thread: ThreadPtr) -> Result<(), String> {
        let object_info = self
            .lookup_info("java/lang/Object")
            .ok_or("missing class info for java/lang/Object")?;
        let class_info = self
            .lookup_info("java/lang/Class")
            .ok_or("missing class info for java/lang/Class")?;
        let string_info = self
            .lookup_info("java/lang/String")
            .ok_or("missing class info for java/lang/String")?;

        self.class_info_class = Some(class_info);

        self.object_class = self.find_class_by_info(thread, object_info);
        if self.object_class.is_null() {
            return Err("unable to load java/lang/Object".to_string());
        }
        self.class_class = self.find_class_by_info(thread, class_info);
        if self.class_class.is_null() {
            return Err("unable to load java/lang/Class".to_string());
        }
        // Deferred fixup for classes created while java/lang/Class was not
        // yet available.
        let class_class = self.class_class;
        self.each_class(|c| {
            Object::set_class(c.class_instance, class_class);
        });

        self.string_class = self.find_class_by_info(thread, string_info);
        if self.string_class.is_null() {
            return Err("unable to load java/lang/String".to_string());
        }

        // Primitive singletons.
        for d in [b'Z', b'B', b'C', b'S', b'I', b'J', b'F', b'D', b'V'] {
            let info = primitive_info_by_descriptor(d).expect("primitive info");
            if self.find_class_by_info(thread, info).is_null() {
                return Err(format!("unable to create primitive class {}", d as char));
            }
        }
        return Ok(());
    }

    /// The 4.1 loading protocol. Returns null with a pending exception on
    /// failure.
    pub fn find_class_by_info(&mut self, thread: ThreadPtr, info: ClassInfoRef) -> JClassPtr {
        monitor::enter_monitor(thread, self.lock);
        let key = info as *const ClassInfo as usize;

        if let Some(&clazz) = self.classes.get(&key) {
            if clazz.is_not_null() {
                monitor::exit_monitor(thread, self.lock);
                return clazz;
            }
        }

        log::debug!("bootstrap loader: loading class {}", info.name);

        // Reserve the bookkeeping entry before allocating the class block so
        // a collection triggered by the allocation cannot race the mapping.
        self.classes.insert(key, JClassPtr::null());

        // Superclass first; it must be at least Resolved.
        let mut superclass = JClassPtr::null();
        if let Some(sup) = info.super_class {
            superclass = self.find_class_by_info(thread, sup);
            if superclass.is_null() || superclass.state < ClassState::Resolved {
                self.classes.remove(&key);
                monitor::exit_monitor(thread, self.lock);
                log::warn!("bootstrap loader: unable to load superclass of {}", info.name);
                if !exception::occurred(thread) {
                    exception::set_no_class_def_found(thread, sup.name);
                }
                return JClassPtr::null();
            }
        }

        // The class block and its java/lang/Class instance are allocated
        // contiguously in the large-object region, so both addresses are
        // stable for the lifetime of the process.
        let class_size = align_size_up(info.class_size, SIZE_ALIGNMENT);
        let instance_size = align_size_up(
            self.class_info_class.expect("loader not bootstrapped").instance_size,
            SIZE_ALIGNMENT,
        );
        let vm = thread.vm();
        let block = vm.as_mut_ref().heap.alloc_class_block(thread, class_size + instance_size);
        if block.is_null() {
            self.classes.remove(&key);
            monitor::exit_monitor(thread, self.lock);
            exception::set_oom(thread);
            return JClassPtr::null();
        }

        let clazz: JClassPtr = Ptr::from_addr(block);
        self.classes.insert(key, clazz);
        {
            let c = clazz.as_mut_ref();
            c.state = ClassState::Registered;
            c.info = Ptr::from_ref(info);
            c.class_loader = ObjectPtr::null();
        }

        let class_obj: ObjectPtr = Ptr::from_addr(block.uoffset(class_size));
        // Null until java/lang/Class exists; bootstrap() patches these.
        Object::set_class(class_obj, self.class_class);
        if let Some(class_info) = self.class_info_class {
            // The Class instance points back at its runtime class block.
            if let Some(f) = class_info.instance_fields.first() {
                let slot: Ptr<JLong> = class_obj.cast::<u8>().offset(f.offset as isize).cast();
                *slot.as_mut_ref() = clazz.as_usize() as JLong;
            }
        }

        // The class monitor must exist before anything can lock the class,
        // including monitor creation for its instances.
        monitor::monitor_create(JClass::as_object(clazz));

        (info.resolve)(clazz);
        {
            let c = clazz.as_mut_ref();
            c.super_class = superclass;
            c.class_instance = class_obj;
        }

        if !info.interfaces.is_empty() {
            let count = info.interfaces.len();
            let storage = Heap::alloc_uncollectable(count * std::mem::size_of::<JClassPtr>());
            let interfaces: Ptr<JClassPtr> = Ptr::from_addr(storage);
            for (i, &iface_info) in info.interfaces.iter().enumerate() {
                let iface = self.find_class_by_info(thread, iface_info);
                if iface.is_null() || iface.state < ClassState::Resolved {
                    clazz.as_mut_ref().state = ClassState::Error;
                    monitor::exit_monitor(thread, self.lock);
                    if !exception::occurred(thread) {
                        exception::set_no_class_def_found(thread, iface_info.name);
                    }
                    return JClassPtr::null();
                }
                *interfaces.offset(i as isize).as_mut_ref() = iface;
            }
            let c = clazz.as_mut_ref();
            c.interfaces = interfaces;
            c.interface_count = count as u32;
        }

        clazz.as_mut_ref().state = ClassState::Resolved;
        monitor::exit_monitor(thread, self.lock);
        return clazz;
    }

    /// Lookup by internal name; a leading `[` synthesizes an array class.
    pub fn find_class(&mut self, thread: ThreadPtr, name: &str) -> JClassPtr {
        if name.as_bytes().first() == Some(&b'[') {
            return self.find_array_class(thread, name);
        }
        match self.lookup_info(name) {
            Some(info) => self.find_class_by_info(thread, info),
            None => {
                exception::set_no_class_def_found(thread, name);
                JClassPtr::null()
            }
        }
    }

    fn find_array_class(&mut self, thread: ThreadPtr, desc: &str) -> JClassPtr {
        monitor::enter_monitor(thread, self.lock);
        if let Some(&clazz) = self.array_classes.get(desc) {
            monitor::exit_monitor(thread, self.lock);
            return clazz;
        }

        let element_desc = &desc[1..];
        let component = match element_desc.as_bytes().first() {
            Some(b'[') => self.find_class(thread, element_desc),
            Some(b'L') => self.find_class(thread, &element_desc[1..element_desc.len() - 1]),
            Some(&d) => match primitive_info_by_descriptor(d) {
                Some(info) => self.find_class_by_info(thread, info),
                None => JClassPtr::null(),
            },
            None => JClassPtr::null(),
        };
        if component.is_null() {
            monitor::exit_monitor(thread, self.lock);
            if !exception::occurred(thread) {
                exception::set_no_class_def_found(thread, desc);
            }
            return JClassPtr::null();
        }

        let object_info = self.object_class.info.as_ref();
        let info: ClassInfoRef = Box::leak(Box::new(ClassInfo {
            access_flags: CLASS_ACC_PUBLIC | CLASS_ACC_FINAL,
            name: Box::leak(desc.to_string().into_boxed_str()),
            super_class: Some(object_info),
            interfaces: rt::array_interfaces(),
            fields: &[],
            methods: &[],
            resolve: resolve_array,
            class_size: align_size_up(std::mem::size_of::<ArrayClass>(), SIZE_ALIGNMENT),
            instance_size: std::mem::size_of::<JavaArray>(),
            static_fields: &[],
            instance_fields: &[],
            vtable: object_info.vtable,
            itable: &[],
            clinit: None,
            finalizer: None,
            element: Some(component.info.as_ref()),
        }));

        let clazz = self.find_class_by_info(thread, info);
        if clazz.is_not_null() {
            ArrayClass::of(clazz).as_mut_ref().component = component;
            self.array_classes.insert(desc.to_string(), clazz);
        }
        monitor::exit_monitor(thread, self.lock);
        return clazz;
    }

    /// jvms8 5.5. Returns false with a pending exception on failure.
    pub fn init_class(&mut self, thread: ThreadPtr, clazz: JClassPtr) -> bool {
        if clazz.state == ClassState::Initialized {
            return true;
        }

        let obj = JClass::as_object(clazz);
        let enter = monitor::monitor_enter(thread, obj);
        debug_assert!(enter == ThreadResult::Success);

        loop {
            match clazz.state {
                ClassState::Initialized => {
                    monitor::monitor_exit(thread, obj);
                    return true;
                }
                ClassState::Initializing => {
                    if clazz.init_thread == thread.thread_id {
                        // Recursive request from the initializing thread.
                        monitor::monitor_exit(thread, obj);
                        return true;
                    }
                    // Another thread is initializing; wait and retry.
                    monitor::monitor_wait(thread, obj, 0, 0);
                }
                ClassState::Error => {
                    monitor::monitor_exit(thread, obj);
                    exception::set_no_class_def_found(thread, clazz.name());
                    return false;
                }
                ClassState::Resolved => break,
                ClassState::Allocated | ClassState::Registered => {
                    monitor::monitor_exit(thread, obj);
                    exception::set_no_class_def_found(thread, clazz.name());
                    return false;
                }
            }
        }

        debug_assert!(clazz.init_thread == 0);
        {
            let c = clazz.as_mut_ref();
            c.state = ClassState::Initializing;
            c.init_thread = thread.thread_id;
        }
        monitor::monitor_exit(thread, obj);

        log::debug!("initializing class {}", clazz.name());

        // Final statics with ConstantValue attributes are emitted by the
        // translator as leading stores in <clinit>.

        let mut success = true;

        if clazz.super_class.is_not_null() && !self.init_class(thread, clazz.super_class) {
            success = false;
        }
        if success {
            for iface in clazz.interfaces_slice() {
                if !self.init_class(thread, *iface) {
                    success = false;
                    break;
                }
            }
        }
        if success && clazz.is_array() {
            let component = ArrayClass::of(clazz).component;
            if component.is_not_null() && !self.init_class(thread, component) {
                success = false;
            }
        }

        if success {
            if let Some(clinit) = clazz.info.clinit {
                let prev_calling = thread.calling_class;
                thread.as_mut_ref().calling_class = clazz;
                clinit(thread);
                thread.as_mut_ref().calling_class = prev_calling;
                if exception::occurred(thread) {
                    exception::wrap_initializer_failure(thread, clazz.name());
                    success = false;
                }
            }
        }

        monitor::monitor_enter(thread, obj);
        clazz.as_mut_ref().state = if success {
            ClassState::Initialized
        } else {
            ClassState::Error
        };
        clazz.as_mut_ref().init_thread = 0;
        monitor::monitor_notify_all(thread, obj);
        monitor::monitor_exit(thread, obj);

        if !success && !exception::occurred(thread) {
            exception::set_no_class_def_found(thread, clazz.name());
        }
        return success;
    }
}

/// Resolve + initialize by info, through the current thread's VM.
pub fn get_class_init(thread: ThreadPtr, info: ClassInfoRef) -> JClassPtr {
    let vm = thread.vm();
    let loader = &mut vm.as_mut_ref().class_loader;
    let clazz = loader.find_class_by_info(thread, info);
    if clazz.is_null() {
        return JClassPtr::null();
    }
    if !loader.init_class(thread, clazz) {
        return JClassPtr::null();
    }
    return clazz;
}

pub fn get_class_by_name_init(thread: ThreadPtr, name: &str) -> JClassPtr {
    let vm = thread.vm();
    let loader = &mut vm.as_mut_ref().class_loader;
    let clazz = loader.find_class(thread, name);
    if clazz.is_null() {
        return JClassPtr::null();
    }
    if !loader.init_class(thread, clazz) {
        return JClassPtr::null();
    }
    return clazz;
}

/// Resolve only (ldc does not initialize).
pub fn get_class_by_name(thread: ThreadPtr, name: &str) -> JClassPtr {
    let vm = thread.vm();
    return vm.as_mut_ref().class_loader.find_class(thread, name);
}

//*********************************************************************************************************
// Resolve handlers
//*********************************************************************************************************

/// Copy the translator's pre-resolved field tables into runtime tables and
/// compute the GC short-circuit flags.
pub fn resolve_ordinary(clazz: JClassPtr) {
    let info = clazz.info.as_ref();
    let c = clazz.as_mut_ref();

    let static_count = info.static_fields.len();
    if static_count > 0 {
        let storage = Heap::alloc_uncollectable(static_count * std::mem::size_of::<ResolvedField>());
        let statics: Ptr<ResolvedField> = Ptr::from_addr(storage);
        let mut has_ref = false;
        for (i, pre) in info.static_fields.iter().enumerate() {
            let field = &info.fields[pre.field_index as usize];
            *statics.offset(i as isize).as_mut_ref() = ResolvedField {
                info: Ptr::from_ref(field),
                offset: pre.offset,
                is_reference: pre.is_reference,
                is_static: true,
            };
            has_ref |= pre.is_reference;
        }
        c.statics = statics;
        c.static_count = static_count as u32;
        c.has_static_reference = has_ref;
    }

    let field_count = info.instance_fields.len();
    if field_count > 0 {
        let storage = Heap::alloc_uncollectable(field_count * std::mem::size_of::<ResolvedField>());
        let fields: Ptr<ResolvedField> = Ptr::from_addr(storage);
        let mut has_ref = false;
        for (i, pre) in info.instance_fields.iter().enumerate() {
            let declaring = pre.declaring.unwrap_or(info);
            let field = &declaring.fields[pre.field_index as usize];
            *fields.offset(i as isize).as_mut_ref() = ResolvedField {
                info: Ptr::from_ref(field),
                offset: pre.offset,
                is_reference: pre.is_reference,
                is_static: false,
            };
            has_ref |= pre.is_reference;
        }
        c.fields = fields;
        c.field_count = field_count as u32;
        c.has_reference = has_ref;
    }
}

pub fn resolve_primitive(clazz: JClassPtr) {
    let c = clazz.as_mut_ref();
    c.interface_count = 0;
    c.static_count = 0;
    c.has_static_reference = false;
    c.field_count = 0;
    c.has_reference = false;
}

pub fn resolve_array(clazz: JClassPtr) {
    resolve_primitive(clazz);
}

//*********************************************************************************************************
// Resolution
//*********************************************************************************************************

/// Search order: instance fields, static fields, interfaces (recursively),
/// then the superclass.
pub fn field_find(clazz: JClassPtr, name: &str, desc: &str) -> Option<Ptr<ResolvedField>> {
    for (i, f) in clazz.fields_slice().iter().enumerate() {
        if f.matches(name, desc) {
            return Some(clazz.fields.offset(i as isize));
        }
    }
    for (i, f) in clazz.statics_slice().iter().enumerate() {
        if f.matches(name, desc) {
            return Some(clazz.statics.offset(i as isize));
        }
    }
    for iface in clazz.interfaces_slice() {
        if let Some(f) = field_find(*iface, name, desc) {
            return Some(f);
        }
    }
    if clazz.super_class.is_not_null() {
        return field_find(clazz.super_class, name, desc);
    }
    return None;
}

/// Declared methods by string equality; initializers are not inherited.
pub fn method_find(info: ClassInfoRef, name: &str, desc: &str) -> Option<&'static MethodInfo> {
    for m in info.methods {
        if m.name == name && m.descriptor == desc {
            return Some(m);
        }
    }
    if name == "<init>" || name == "<clinit>" {
        return None;
    }
    if let Some(sup) = info.super_class {
        if let Some(m) = method_find(sup, name, desc) {
            return Some(m);
        }
    }
    for iface in info.interfaces {
        if let Some(m) = method_find(*iface, name, desc) {
            return Some(m);
        }
    }
    return None;
}

/// Translator-assigned slot of a virtual method.
pub fn vtable_find(info: ClassInfoRef, name: &str, desc: &str) -> Option<u16> {
    for (i, entry) in info.vtable.iter().enumerate() {
        if entry.method.name == name && entry.method.descriptor == desc {
            return Some(i as u16);
        }
    }
    return None;
}

/// Allocate a zeroed instance of an initialized class.
pub fn alloc_instance(thread: ThreadPtr, clazz: JClassPtr) -> ObjectPtr {
    let size = clazz.info.instance_size;
    let vm = thread.vm();
    let addr = vm.as_mut_ref().heap.alloc(thread, size);
    if addr.is_null() {
        exception::set_oom(thread);
        return ObjectPtr::null();
    }
    let obj = ObjectPtr::from_addr(addr);
    Object::set_class(obj, clazz);
    return obj;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt;
    use crate::test_support::run_default;

    #[test]
    fn registry_lookup_and_resolution() {
        run_default(|vm, _thread| {
            let loader = &vm.as_ref().class_loader;
            assert!(loader.lookup_info("java/lang/Object").is_some());
            assert!(loader.lookup_info("java/lang/NoSuch").is_none());

            // Initializers are not inherited.
            assert!(method_find(&rt::JAVA_LANG_THROWABLE, "<init>", "(Ljava/lang/String;)V").is_some());
            assert!(method_find(&rt::JAVA_LANG_RUNTIME_EXCEPTION, "<init>", "(Ljava/lang/String;)V").is_none());

            // Ordinary methods resolve up the superclass chain.
            let m = method_find(&rt::JAVA_LANG_RUNTIME_EXCEPTION, "getMessage", "()Ljava/lang/String;");
            assert!(m.is_some());

            // Translator-assigned vtable slots.
            assert_eq!(vtable_find(&rt::JAVA_LANG_THROWABLE, "printStackTrace", "()V"), Some(0));
            assert_eq!(
                vtable_find(&rt::JAVA_LANG_THROWABLE, "getMessage", "()Ljava/lang/String;"),
                Some(1)
            );
        });
    }

    #[test]
    fn field_resolution_walks_the_hierarchy() {
        run_default(|vm, thread| {
            let loader = &mut vm.as_mut_ref().class_loader;
            let npe_info = loader.lookup_info("java/lang/NullPointerException").unwrap();
            let npe = loader.find_class_by_info(thread, npe_info);
            assert!(npe.is_not_null());
            assert_eq!(npe.state, ClassState::Resolved);

            // detailMessage is inherited from Throwable with its final
            // offset already applied.
            let field = field_find(npe, "detailMessage", "Ljava/lang/String;").unwrap();
            assert!(field.is_reference);
            assert!(!field.is_static);
            assert_eq!(field.offset, std::mem::size_of::<crate::object::ObjectHeader>());

            assert!(field_find(npe, "noSuchField", "I").is_none());
        });
    }

    #[test]
    fn class_blocks_are_stable_and_monitored() {
        run_default(|vm, thread| {
            let loader = &mut vm.as_mut_ref().class_loader;
            let system_info = loader.lookup_info("java/lang/System").unwrap();
            let first = loader.find_class_by_info(thread, system_info);
            let second = loader.find_class_by_info(thread, system_info);
            assert!(first == second);
            // Class monitors exist from creation time.
            assert!(crate::object::Object::monitor(JClass::as_object(first)).is_not_null());
            // The Class instance sits right after the class block and knows
            // its runtime class.
            assert!(first.class_instance.is_not_null());
            assert!(
                crate::object::Object::class_of(first.class_instance)
                    == vm.as_ref().class_loader.class_class()
            );
        });
    }

    #[test]
    fn array_synthesis_reuses_instances() {
        run_default(|vm, thread| {
            let loader = &mut vm.as_mut_ref().class_loader;
            let a = loader.find_class(thread, "[[I");
            let b = loader.find_class(thread, "[[I");
            assert!(a.is_not_null());
            assert!(a == b);
            assert!(a.is_array());
            let component = crate::object::class::ArrayClass::of(a).component;
            assert!(component.is_not_null());
            assert_eq!(component.name(), "[I");
        });
    }
}
