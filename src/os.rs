use crate::memory::Address;

static mut PAGE_SIZE: isize = -1;
static mut NUM_PROCESSORS: usize = 0;

pub fn init() {
    unsafe {
        PAGE_SIZE = raw_page_size();
        NUM_PROCESSORS = raw_num_processors();
    }
}

pub fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == -1 {
            panic!("must call os::init() prior to using it");
        }
        return PAGE_SIZE as usize;
    }
}

pub fn num_processors() -> usize {
    unsafe {
        if NUM_PROCESSORS == 0 {
            panic!("must call os::init() prior to using it");
        }
        return NUM_PROCESSORS;
    }
}

#[cfg(unix)]
fn raw_page_size() -> isize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as isize }
}

#[cfg(unix)]
fn raw_num_processors() -> usize {
    let np = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    return if np < 1 { 1 } else { np as usize };
}

/// Reserve an address range without backing it. The range must be committed
/// with [commit_memory] before any access.
#[cfg(unix)]
pub fn reserve_memory(size: usize) -> Address {
    let res = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if res == libc::MAP_FAILED {
        return Address::null();
    } else {
        return Address::new(res.cast());
    }
}

#[cfg(unix)]
pub fn commit_memory(addr: Address, size: usize) -> bool {
    let res = unsafe { libc::mprotect(addr.as_mut_raw_ptr() as _, size, libc::PROT_READ | libc::PROT_WRITE) };
    return res == 0;
}

#[cfg(unix)]
pub fn uncommit_memory(addr: Address, size: usize) -> bool {
    let res = unsafe { libc::mprotect(addr.as_mut_raw_ptr() as _, size, libc::PROT_NONE) };
    return res == 0;
}

#[cfg(unix)]
pub fn release_memory(addr: Address, size: usize) -> i32 {
    unsafe { libc::munmap(addr.as_mut_raw_ptr() as _, size) }
}

#[cfg(windows)]
fn raw_page_size() -> isize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    unsafe {
        let mut si: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut si);
        si.dwPageSize as isize
    }
}

#[cfg(windows)]
fn raw_num_processors() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    unsafe {
        let mut si: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut si);
        let np = si.dwNumberOfProcessors as usize;
        if np < 1 {
            1
        } else {
            np
        }
    }
}

#[cfg(windows)]
pub fn reserve_memory(size: usize) -> Address {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};
    let res = unsafe { VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
    if res.is_null() {
        return Address::null();
    }
    return Address::new(res.cast());
}

#[cfg(windows)]
pub fn commit_memory(addr: Address, size: usize) -> bool {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};
    let res = unsafe { VirtualAlloc(addr.as_mut_raw_ptr() as _, size, MEM_COMMIT, PAGE_READWRITE) };
    return !res.is_null();
}

#[cfg(windows)]
pub fn uncommit_memory(addr: Address, size: usize) -> bool {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_DECOMMIT;
    let res = unsafe { VirtualFree(addr.as_mut_raw_ptr() as _, size, MEM_DECOMMIT) };
    return res != 0;
}

#[cfg(windows)]
pub fn release_memory(addr: Address, _size: usize) -> i32 {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    let res = unsafe { VirtualFree(addr.as_mut_raw_ptr() as _, 0, MEM_RELEASE) };
    return if res != 0 { 0 } else { -1 };
}
