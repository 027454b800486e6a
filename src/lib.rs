#![no_std]

//! Slab heap for hobby kernels
//!
//! Carves single pages from a [`PageProvider`] into slabs of 16 fixed size
//! classes and serves byte-granular `alloc`/`free`/`resize`/`zero_alloc`
//! from them. The owning slab of any object is recovered by masking the
//! object address down to its page, so no external address map is needed.


use core::cell::UnsafeCell;
use core::ptr::null_mut;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};
use log::{debug, error};
use spin::{Mutex, Once};

/// Page size assumed by the heap. Pages returned by the [`PageProvider`]
/// must be this large and aligned to it.
pub const PAGE_SIZE: usize = 4096;

/// Object sizes served by the heap, ascending. A request is satisfied from
/// the smallest class that covers it.
pub const SIZE_CLASSES: [usize; SIZE_CLASS_COUNT] = [
    16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131072, 262144, 524288,
];
pub const SIZE_CLASS_COUNT: usize = 16;

/// Start of the object region within a slab page. The header sits below it;
/// rounding to the smallest class keeps every slot at least 16-aligned.
const OBJECT_REGION_OFFSET: usize = align_up(size_of::<SlabHeader>(), SIZE_CLASSES[0]);

const _: () = assert!(PAGE_SIZE.is_power_of_two());
// A free object stores the freelist link in its own first bytes
const _: () = assert!(SIZE_CLASSES[0] >= size_of::<FreeObject>());
const _: () = assert!(OBJECT_REGION_OFFSET + SIZE_CLASSES[0] <= PAGE_SIZE);

/// Source of page-aligned whole pages, the only path through which the heap
/// obtains memory.
pub trait PageProvider {
    /// Allocates `page_count` contiguous pages.
    ///
    /// # Safety
    /// Returned memory must be [`PAGE_SIZE`]-aligned. May return null on
    /// exhaustion; the heap treats that as a plain allocation failure.
    unsafe fn alloc_pages(&mut self, page_count: usize) -> *mut u8;

    /// Returns pages to the provider.
    ///
    /// Reserved for hosts that trim retained slabs themselves; the heap
    /// never calls it because slabs are kept for reuse once created.
    unsafe fn free_pages(&mut self, page_ptr: *mut u8, page_count: usize);
}

/// Slab metadata, stored at the base of the slab's page
#[repr(C)]
struct SlabHeader {
    /// Link into the partial/full/empty list of the owning cache
    list_link: LinkedListLink,
    /// LinkedList doesn't give mutable access to data, we have to snip the data in UnsafeCell
    data: UnsafeCell<SlabHeaderData>,
}

// To keep a heap in a static the compiler requires Send and Sync for SlabHeader.
// Headers are internal and only ever touched through the heap, whose access
// is always synchronised externally, so the impls are sound.
unsafe impl Send for SlabHeader {}
unsafe impl Sync for SlabHeader {}

struct SlabHeaderData {
    /// Free objects in this slab
    free_objects: LinkedList<FreeObjectAdapter>,
    /// Number of free objects in this slab
    free_count: usize,
    /// Size class this slab serves; constant after construction
    object_size: usize,
}

#[derive(Debug)]
#[repr(transparent)]
/// Metadata stored inside a free object and pointing to the previous and next free object
struct FreeObject {
    free_object_link: LinkedListLink,
}

intrusive_adapter!(SlabHeaderAdapter = UnsafeRef<SlabHeader>: SlabHeader { list_link: LinkedListLink });
intrusive_adapter!(FreeObjectAdapter = UnsafeRef<FreeObject>: FreeObject { free_object_link: LinkedListLink });

/// Recovers the owning slab of an allocated object.
///
/// Slabs are exactly one page and page-aligned, so masking the low bits of
/// any object address yields its slab header. This is the only place that
/// relies on the layout trick.
fn slab_of(object_ptr: *mut u8) -> *mut SlabHeader {
    align_down(object_ptr as usize, PAGE_SIZE) as *mut SlabHeader
}

const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Index of the smallest class covering `size`, or `None` above the largest
fn size_class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| class >= size)
}

/// Objects a single slab of the class covering `size` holds.
///
/// Zero for classes that cannot fit one object behind the slab header;
/// such requests are refused by [`Heap::alloc`].
pub fn slab_capacity(size: usize) -> Option<usize> {
    let class = SIZE_CLASSES[size_class_index(size)?];
    Some((PAGE_SIZE - OBJECT_REGION_OFFSET) / class)
}

/// Bookkeeping for one size class: three slab lists and counters
struct SizeClassCache {
    object_size: usize,
    /// Total objects in a slab of this class
    objects_per_slab: usize,
    /// Slabs with both free and allocated objects
    partial_slabs: LinkedList<SlabHeaderAdapter>,
    /// Slabs with no free objects
    full_slabs: LinkedList<SlabHeaderAdapter>,
    /// Slabs with all objects free, retained for reuse
    empty_slabs: LinkedList<SlabHeaderAdapter>,
    statistics: CacheStatistics,
}

impl SizeClassCache {
    fn new(object_size: usize) -> Self {
        Self {
            object_size,
            objects_per_slab: (PAGE_SIZE - OBJECT_REGION_OFFSET) / object_size,
            partial_slabs: LinkedList::new(SlabHeaderAdapter::new()),
            full_slabs: LinkedList::new(SlabHeaderAdapter::new()),
            empty_slabs: LinkedList::new(SlabHeaderAdapter::new()),
            statistics: CacheStatistics {
                partial_slabs_number: 0,
                full_slabs_number: 0,
                empty_slabs_number: 0,
                free_objects_number: 0,
                allocated_objects_number: 0,
            },
        }
    }

    /// Carves a fresh page into a slab and prepends it to the partial list
    unsafe fn grow<P: PageProvider>(&mut self, page_provider: &mut P) -> bool {
        let page_ptr = page_provider.alloc_pages(1);
        if page_ptr.is_null() {
            debug!("size class {}: page provider exhausted", self.object_size);
            return false;
        }
        assert_eq!(
            page_ptr as usize % PAGE_SIZE,
            0,
            "Page provider returned an unaligned page"
        );

        // Header at the page base, objects after it
        let header_ptr = page_ptr as *mut SlabHeader;
        header_ptr.write(SlabHeader {
            list_link: LinkedListLink::new(),
            data: UnsafeCell::new(SlabHeaderData {
                free_objects: LinkedList::new(FreeObjectAdapter::new()),
                free_count: self.objects_per_slab,
                object_size: self.object_size,
            }),
        });

        // Thread every slot into the freelist, ascending address order
        for object_index in 0..self.objects_per_slab {
            let object_addr =
                page_ptr as usize + OBJECT_REGION_OFFSET + object_index * self.object_size;
            assert_eq!(
                object_addr % align_of::<FreeObject>(),
                0,
                "FreeObject addr not aligned!"
            );
            let free_object_ptr = object_addr as *mut FreeObject;
            free_object_ptr.write(FreeObject {
                free_object_link: LinkedListLink::new(),
            });
            (*(*header_ptr).data.get())
                .free_objects
                .push_back(UnsafeRef::from_raw(free_object_ptr));
        }

        self.partial_slabs.push_front(UnsafeRef::from_raw(header_ptr));
        self.statistics.partial_slabs_number += 1;
        self.statistics.free_objects_number += self.objects_per_slab;
        true
    }

    /// Pops one object from the head partial slab
    unsafe fn alloc_object<P: PageProvider>(&mut self, page_provider: &mut P) -> *mut u8 {
        if self.objects_per_slab == 0 {
            // Class does not fit behind the header of a single page and
            // there is no multi-page path
            debug!(
                "size class {}: unsupported, objects don't fit in a slab",
                self.object_size
            );
            return null_mut();
        }

        if self.partial_slabs.is_empty() {
            // Recycle a retained empty slab before asking for a new page
            if let Some(slab_ref) = self.empty_slabs.pop_front() {
                self.partial_slabs.push_front(slab_ref);
                self.statistics.empty_slabs_number -= 1;
                self.statistics.partial_slabs_number += 1;
            } else if !self.grow(page_provider) {
                return null_mut();
            }
        }

        let header_ptr: *const SlabHeader = self.partial_slabs.front().get().unwrap();
        let data = &mut *(*header_ptr).data.get();

        let free_object_ref = data.free_objects.pop_front().unwrap();
        data.free_count -= 1;
        let object_ptr = UnsafeRef::into_raw(free_object_ref);
        self.statistics.free_objects_number -= 1;
        self.statistics.allocated_objects_number += 1;

        // Slab became full? (partial -> full)
        if data.free_count == 0 {
            let slab_ref = self.partial_slabs.pop_front().unwrap();
            self.full_slabs.push_front(slab_ref);
            self.statistics.partial_slabs_number -= 1;
            self.statistics.full_slabs_number += 1;
        }

        object_ptr.cast()
    }

    /// Pushes an object back onto its slab's freelist and migrates the slab
    /// between lists when the free count crosses a boundary
    unsafe fn free_object(&mut self, object_ptr: *mut u8) {
        let header_ptr = slab_of(object_ptr);
        let data = &mut *(*header_ptr).data.get();

        let object_offset = object_ptr as usize - header_ptr as usize;
        if object_offset < OBJECT_REGION_OFFSET
            || (object_offset - OBJECT_REGION_OFFSET) % self.object_size != 0
            || (object_offset - OBJECT_REGION_OFFSET) / self.object_size >= self.objects_per_slab
        {
            error!("free: {:p} is not an object of its slab, ignoring", object_ptr);
            return;
        }
        if data.free_count == self.objects_per_slab {
            error!(
                "free: {:p}: slab has no allocated objects, double free or invalid pointer, ignoring",
                object_ptr
            );
            return;
        }
        if let Some(head) = data.free_objects.front().get() {
            if head as *const FreeObject as usize == object_ptr as usize {
                error!("free: {:p} is already free (double free), ignoring", object_ptr);
                return;
            }
        }

        let free_object_ptr = object_ptr as *mut FreeObject;
        free_object_ptr.write(FreeObject {
            free_object_link: LinkedListLink::new(),
        });
        data.free_objects.push_front(UnsafeRef::from_raw(free_object_ptr));
        data.free_count += 1;
        self.statistics.free_objects_number += 1;
        self.statistics.allocated_objects_number -= 1;

        if data.free_count == 1 {
            // Slab is no longer full (full -> partial; full -> empty for
            // single-object slabs)
            let mut full_list_cursor = self.full_slabs.cursor_mut_from_ptr(header_ptr);
            let slab_ref = full_list_cursor.remove().unwrap();
            self.statistics.full_slabs_number -= 1;
            if data.free_count == self.objects_per_slab {
                self.empty_slabs.push_front(slab_ref);
                self.statistics.empty_slabs_number += 1;
            } else {
                self.partial_slabs.push_front(slab_ref);
                self.statistics.partial_slabs_number += 1;
            }
        } else if data.free_count == self.objects_per_slab {
            // Last allocated object came back (partial -> empty)
            let mut partial_list_cursor = self.partial_slabs.cursor_mut_from_ptr(header_ptr);
            let slab_ref = partial_list_cursor.remove().unwrap();
            self.empty_slabs.push_front(slab_ref);
            self.statistics.partial_slabs_number -= 1;
            self.statistics.empty_slabs_number += 1;
        }

        debug_assert!(
            self.validate(header_ptr),
            "Slab failed consistency check after free"
        );
    }

    /// Best-effort consistency check of one slab: freelist stays inside the
    /// object region, walks without revisiting, and agrees with free_count
    unsafe fn validate(&self, header_ptr: *const SlabHeader) -> bool {
        let data = &*(*header_ptr).data.get();
        if data.object_size != self.object_size {
            return false;
        }
        if data.free_count > self.objects_per_slab {
            return false;
        }

        let region_start = header_ptr as usize + OBJECT_REGION_OFFSET;
        let region_end = region_start + self.objects_per_slab * self.object_size;
        let mut walked = 0usize;
        for free_object in data.free_objects.iter() {
            let object_addr = free_object as *const FreeObject as usize;
            if object_addr < region_start || object_addr >= region_end {
                return false;
            }
            if (object_addr - region_start) % self.object_size != 0 {
                return false;
            }
            walked += 1;
            if walked > self.objects_per_slab {
                // Longer than the slab can hold, the list must cycle
                return false;
            }
        }
        walked == data.free_count
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStatistics {
    /// Number of slabs with both free and allocated objects
    pub partial_slabs_number: usize,
    /// Number of slabs in which all objects are allocated
    pub full_slabs_number: usize,
    /// Number of retained slabs with no allocated objects
    pub empty_slabs_number: usize,
    /// Number of objects available for allocation without taking a new page
    pub free_objects_number: usize,
    /// Number of objects currently handed out
    pub allocated_objects_number: usize,
}

/// The heap: one cache per size class plus the owned page provider.
///
/// All methods take `&mut self`; hosts that share the heap between callers
/// wrap it in their guard or use [`LockedHeap`].
pub struct Heap<P: PageProvider> {
    caches: [SizeClassCache; SIZE_CLASS_COUNT],
    page_provider: P,
}

impl<P: PageProvider> Heap<P> {
    pub fn new(page_provider: P) -> Self {
        Self {
            caches: core::array::from_fn(|class_index| {
                SizeClassCache::new(SIZE_CLASSES[class_index])
            }),
            page_provider,
        }
    }

    /// Allocates at least `size` bytes.
    ///
    /// The memory is uninitialized. Returns null if the request exceeds the
    /// largest servable class or the page provider is exhausted; the heap is
    /// unchanged in that case.
    ///
    /// # Safety
    /// May return null pointer
    pub unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
        let class_index = match size_class_index(size) {
            Some(class_index) => class_index,
            None => {
                debug!("alloc: {} bytes exceeds the largest size class", size);
                return null_mut();
            }
        };
        self.caches[class_index].alloc_object(&mut self.page_provider)
    }

    /// Returns an object to the heap. Null is a documented no-op.
    ///
    /// Detected inconsistencies (double free, pointer into no live slab) are
    /// logged and the free is dropped without touching heap state.
    ///
    /// # Safety
    /// `object_ptr` must be null or a pointer obtained from this heap and
    /// not freed since
    pub unsafe fn free(&mut self, object_ptr: *mut u8) {
        if object_ptr.is_null() {
            return;
        }

        let header_ptr = slab_of(object_ptr);
        let object_size = (*(*header_ptr).data.get()).object_size;
        let class_index = match SIZE_CLASSES.iter().position(|&class| class == object_size) {
            Some(class_index) => class_index,
            None => {
                error!(
                    "free: {:p} does not point into a live slab, ignoring",
                    object_ptr
                );
                return;
            }
        };
        self.caches[class_index].free_object(object_ptr);
    }

    /// Grows or keeps an allocation.
    ///
    /// Null behaves as [`Heap::alloc`]. If the owning class already covers
    /// `new_size` the pointer is returned unchanged. Otherwise the contents
    /// move to a fresh allocation and the old object is freed; on allocation
    /// failure the old object is left untouched and null is returned.
    ///
    /// # Safety
    /// `object_ptr` must be null or a pointer obtained from this heap and
    /// not freed since. May return null pointer
    pub unsafe fn resize(&mut self, object_ptr: *mut u8, new_size: usize) -> *mut u8 {
        if object_ptr.is_null() {
            return self.alloc(new_size);
        }

        // The copy below reuses this read; both happen under the caller's
        // exclusive borrow, so the slab cannot change in between
        let old_object_size = (*(*slab_of(object_ptr)).data.get()).object_size;
        if old_object_size >= new_size {
            return object_ptr;
        }

        let new_object_ptr = self.alloc(new_size);
        if new_object_ptr.is_null() {
            return null_mut();
        }
        // The original request size is not retained; copying the whole old
        // class over-copies at most up to the new object's size
        core::ptr::copy_nonoverlapping(object_ptr, new_object_ptr, old_object_size);
        self.free(object_ptr);
        new_object_ptr
    }

    /// Allocates `count * size` bytes and zero-fills the returned block.
    ///
    /// Returns null when the multiplication overflows, in addition to the
    /// [`Heap::alloc`] failure cases.
    ///
    /// # Safety
    /// May return null pointer
    pub unsafe fn zero_alloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => {
                debug!("zero_alloc: {} x {} bytes overflows", count, size);
                return null_mut();
            }
        };

        let object_ptr = self.alloc(total);
        if !object_ptr.is_null() {
            let object_size = (*(*slab_of(object_ptr)).data.get()).object_size;
            core::ptr::write_bytes(object_ptr, 0, object_size);
        }
        object_ptr
    }

    /// Gets counters of the cache serving `size`-byte requests
    pub fn cache_statistics(&self, size: usize) -> Option<CacheStatistics> {
        Some(self.caches[size_class_index(size)?].statistics)
    }
}

/// A [`Heap`] behind a spinlock, lazily set up on first use.
///
/// Suitable for a `static`: the first operation through it materializes the
/// heap (double-checked, so racing first calls initialize once), and every
/// operation runs under the one lock. Hosts whose page provider needs
/// runtime state seed it with [`LockedHeap::init`] instead.
pub struct LockedHeap<P: PageProvider> {
    heap: Once<Mutex<Heap<P>>>,
}

impl<P: PageProvider> LockedHeap<P> {
    pub const fn new() -> Self {
        Self { heap: Once::new() }
    }

    /// Sets up the heap with `page_provider` unless something already did
    pub fn init(&self, page_provider: P) -> &Mutex<Heap<P>> {
        self.heap.call_once(|| Mutex::new(Heap::new(page_provider)))
    }
}

impl<P: PageProvider + Default> LockedHeap<P> {
    fn heap(&self) -> &Mutex<Heap<P>> {
        self.heap.call_once(|| Mutex::new(Heap::new(P::default())))
    }

    /// See [`Heap::alloc`]
    ///
    /// # Safety
    /// May return null pointer
    pub unsafe fn alloc(&self, size: usize) -> *mut u8 {
        self.heap().lock().alloc(size)
    }

    /// See [`Heap::free`]
    ///
    /// # Safety
    /// `object_ptr` must be null or a pointer obtained from this heap and
    /// not freed since
    pub unsafe fn free(&self, object_ptr: *mut u8) {
        self.heap().lock().free(object_ptr)
    }

    /// See [`Heap::resize`]
    ///
    /// # Safety
    /// `object_ptr` must be null or a pointer obtained from this heap and
    /// not freed since. May return null pointer
    pub unsafe fn resize(&self, object_ptr: *mut u8, new_size: usize) -> *mut u8 {
        self.heap().lock().resize(object_ptr, new_size)
    }

    /// See [`Heap::zero_alloc`]
    ///
    /// # Safety
    /// May return null pointer
    pub unsafe fn zero_alloc(&self, count: usize, size: usize) -> *mut u8 {
        self.heap().lock().zero_alloc(count, size)
    }

    /// Gets counters of the cache serving `size`-byte requests
    pub fn cache_statistics(&self, size: usize) -> Option<CacheStatistics> {
        self.heap().lock().cache_statistics(size)
    }
}
