// The `aligned_alloc` crate this module replaces has had every published
// version yanked from the registry; this reproduces its two-function API
// (posix_memalign/free) so call sites elsewhere in the crate are unchanged.

use std::os::raw::c_void;
use std::ptr;

pub fn aligned_alloc(size: usize, align: usize) -> *mut () {
    unsafe {
        let mut memptr: *mut c_void = ptr::null_mut();
        let ret = libc::posix_memalign(&mut memptr, align, size);
        if ret == 0 {
            memptr as *mut ()
        } else {
            ptr::null_mut()
        }
    }
}

pub unsafe fn aligned_free(ptr: *mut ()) {
    libc::free(ptr as *mut c_void);
}
