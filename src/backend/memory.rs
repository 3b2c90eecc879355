// GPU memory suballocation
//
// Two large VkDeviceMemory regions (host-visible and device-local) are allocated
// once at startup. Every buffer and image is placed inside one of them by a
// first-fit search over the sorted list of live allocations.

use anyhow::{Context, Result};
use ash::vk;
use std::ptr::NonNull;

use super::buffer::Buffer;
use super::texture::Texture;
use super::VulkanDevice;

/// Which region an allocation lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Host visible + coherent, persistently mapped
    Host,
    /// Device local, never mapped
    Local,
}

pub type AllocationId = u32;

/// The Vulkan object a header backs. The region destroys it if it is still
/// alive at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceHandle {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Bookkeeping node for one live allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemHeader {
    pub id: AllocationId,
    pub start: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub owner: ResourceHandle,
}

impl MemHeader {
    pub fn end(&self) -> vk::DeviceSize {
        self.start + self.size
    }
}

/// Placement record kept by the allocated object, used to release it later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub id: AllocationId,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub memory_type: MemoryType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub size: vk::DeviceSize,
    pub used: vk::DeviceSize,
    pub free: vk::DeviceSize,
    pub largest_gap: vk::DeviceSize,
    pub allocations: usize,
}

/// Ordered list of allocation headers inside a region of fixed size.
///
/// Headers are kept sorted by `start` and never overlap. Ids start at 1 and
/// are never reused, even after the header is deleted.
#[derive(Debug)]
pub struct FreeList {
    size: vk::DeviceSize,
    headers: Vec<MemHeader>,
    next_id: AllocationId,
}

impl FreeList {
    pub fn new(size: vk::DeviceSize) -> Self {
        Self {
            size,
            headers: Vec::new(),
            next_id: 1,
        }
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[cfg(test)]
    pub fn headers(&self) -> &[MemHeader] {
        &self.headers
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// First-fit placement of `size` bytes aligned to `alignment`.
    ///
    /// Gaps are visited in address order: the space in front of the head, then
    /// the space behind every header up to its successor (or the region end).
    /// Returns `None` and leaves the list untouched when no gap is large enough.
    pub fn allocate(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        owner: ResourceHandle,
    ) -> Option<MemHeader> {
        if size == 0 {
            log::warn!("Refusing zero-sized allocation for {:?}", owner);
            return None;
        }

        let (index, start) = self.find_gap(size, alignment.max(1))?;

        let header = MemHeader {
            id: self.next_id,
            start,
            size,
            owner,
        };
        self.next_id += 1;
        self.headers.insert(index, header);

        Some(header)
    }

    /// Returns the insertion index and aligned start of the first gap that fits
    fn find_gap(
        &self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<(usize, vk::DeviceSize)> {
        if self.headers.is_empty() {
            return (size <= self.size).then_some((0, 0));
        }

        // Gap i sits in front of header i; the last gap runs to the region end
        let mut gap_start = 0;
        for index in 0..=self.headers.len() {
            let gap_end = self
                .headers
                .get(index)
                .map_or(self.size, |header| header.start);

            if let Some(start) = align_up(gap_start, alignment) {
                if start.checked_add(size).is_some_and(|end| end <= gap_end) {
                    return Some((index, start));
                }
            }

            if let Some(header) = self.headers.get(index) {
                gap_start = header.end();
            }
        }

        None
    }

    /// Removes the header with `id`. Unknown ids are reported and ignored.
    pub fn delete(&mut self, id: AllocationId) -> Option<MemHeader> {
        match self.headers.iter().position(|header| header.id == id) {
            Some(index) => Some(self.headers.remove(index)),
            None => {
                log::error!("Tried to delete allocation with invalid id: {}", id);
                None
            }
        }
    }

    /// Removes every header, in address order
    pub fn drain(&mut self) -> Vec<MemHeader> {
        std::mem::take(&mut self.headers)
    }

    pub fn stats(&self) -> MemoryStats {
        let used: vk::DeviceSize = self.headers.iter().map(|header| header.size).sum();

        let mut largest_gap = 0;
        let mut cursor = 0;
        for header in &self.headers {
            largest_gap = largest_gap.max(header.start - cursor);
            cursor = header.end();
        }
        largest_gap = largest_gap.max(self.size - cursor);

        MemoryStats {
            size: self.size,
            used,
            free: self.size - used,
            largest_gap,
            allocations: self.headers.len(),
        }
    }
}

fn align_up(offset: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<vk::DeviceSize> {
    match offset % alignment {
        0 => Some(offset),
        remainder => offset.checked_add(alignment - remainder),
    }
}

/// Host address of a mapped region, if any
#[derive(Debug, Default, Clone, Copy)]
struct Mapping(Option<NonNull<u8>>);

impl Mapping {
    fn is_mapped(&self) -> bool {
        self.0.is_some()
    }

    /// Records the pointer returned by vkMapMemory. An existing mapping wins.
    fn set(&mut self, pointer: *mut std::ffi::c_void) -> bool {
        if self.is_mapped() {
            return false;
        }
        self.0 = NonNull::new(pointer as *mut u8);
        self.is_mapped()
    }

    /// Forgets the mapping, true if there was one to release
    fn clear(&mut self) -> bool {
        self.0.take().is_some()
    }

    fn pointer(
        &self,
        region_size: vk::DeviceSize,
        offset: vk::DeviceSize,
        memory_type: MemoryType,
    ) -> Option<NonNull<u8>> {
        let Some(base) = self.0 else {
            log::error!(
                "Tried to read {:?} memory at offset {} but the block is not mapped",
                memory_type,
                offset
            );
            return None;
        };

        if offset >= region_size {
            log::error!(
                "Offset {} is outside of the {:?} memory block ({} bytes)",
                offset,
                memory_type,
                region_size
            );
            return None;
        }

        NonNull::new(base.as_ptr().wrapping_add(offset as usize))
    }
}

/// One VkDeviceMemory region carved up by a [`FreeList`]
pub struct MemoryBlock {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    memory_type: MemoryType,
    mapped: Mapping,
    free_list: FreeList,
}

impl MemoryBlock {
    /// Performs the one real allocation of this region. No fallback to other
    /// memory types: the caller picks type and size up front.
    pub fn new(
        device: &VulkanDevice,
        memory_type_index: u32,
        size: vk::DeviceSize,
        memory_type: MemoryType,
    ) -> Result<Self> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .device
                .allocate_memory(&alloc_info, None)
                .with_context(|| {
                    format!(
                        "Failed to allocate {:?} memory block of {} bytes (type {})",
                        memory_type, size, memory_type_index
                    )
                })?
        };

        log::info!(
            "Allocated {:?} memory block: {} bytes (type {})",
            memory_type,
            size,
            memory_type_index
        );

        Ok(Self {
            memory,
            memory_type_index,
            memory_type,
            mapped: Mapping::default(),
            free_list: FreeList::new(size),
        })
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn stats(&self) -> MemoryStats {
        self.free_list.stats()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_mapped()
    }

    /// Maps the whole region. Mapping an already mapped region does nothing.
    pub fn map(&mut self, device: &VulkanDevice) -> Result<()> {
        if self.is_mapped() {
            return Ok(());
        }

        let pointer = unsafe {
            device
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .context("Failed to map memory block")?
        };

        anyhow::ensure!(self.mapped.set(pointer), "vkMapMemory returned a null pointer");
        Ok(())
    }

    pub fn unmap(&mut self, device: &VulkanDevice) {
        if self.mapped.clear() {
            unsafe { device.device.unmap_memory(self.memory) };
        }
    }

    /// Pointer into the mapped region at `offset`
    pub fn get_memory(&self, offset: vk::DeviceSize) -> Option<NonNull<u8>> {
        self.mapped.pointer(self.free_list.size(), offset, self.memory_type)
    }

    /// Places and binds `buffer`. `Ok(false)` means the region is full.
    pub fn allocate_buffer(&mut self, device: &VulkanDevice, buffer: &mut Buffer) -> Result<bool> {
        anyhow::ensure!(buffer.allocation.is_none(), "Buffer is already bound");

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer.handle) };
        let Some(header) = self.place(requirements, ResourceHandle::Buffer(buffer.handle))? else {
            return Ok(false);
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer.handle, self.memory, header.start)
        };
        if let Err(e) = bound {
            self.free_list.delete(header.id);
            return Err(e).context("Failed to bind buffer memory");
        }

        buffer.allocation = Some(self.allocation(&header));
        Ok(true)
    }

    /// Places and binds `texture`. `Ok(false)` means the region is full.
    pub fn allocate_texture(
        &mut self,
        device: &VulkanDevice,
        texture: &mut Texture,
    ) -> Result<bool> {
        anyhow::ensure!(texture.allocation.is_none(), "Image is already bound");

        let requirements = unsafe { device.device.get_image_memory_requirements(texture.image) };
        let Some(header) = self.place(requirements, ResourceHandle::Image(texture.image))? else {
            return Ok(false);
        };

        let bound = unsafe {
            device
                .device
                .bind_image_memory(texture.image, self.memory, header.start)
        };
        if let Err(e) = bound {
            self.free_list.delete(header.id);
            return Err(e).context("Failed to bind image memory");
        }

        texture.allocation = Some(self.allocation(&header));
        Ok(true)
    }

    fn place(
        &mut self,
        requirements: vk::MemoryRequirements,
        owner: ResourceHandle,
    ) -> Result<Option<MemHeader>> {
        if requirements.memory_type_bits & (1 << self.memory_type_index) == 0 {
            anyhow::bail!(
                "{:?} cannot live in memory type {} (allowed: {:#b})",
                owner,
                self.memory_type_index,
                requirements.memory_type_bits
            );
        }

        let header = self
            .free_list
            .allocate(requirements.size, requirements.alignment, owner);

        if header.is_none() {
            let stats = self.free_list.stats();
            log::warn!(
                "{:?} memory block exhausted: need {} bytes (alignment {}), largest gap {}",
                self.memory_type,
                requirements.size,
                requirements.alignment,
                stats.largest_gap
            );
        }

        Ok(header)
    }

    fn allocation(&self, header: &MemHeader) -> Allocation {
        Allocation {
            id: header.id,
            offset: header.start,
            size: header.size,
            memory_type: self.memory_type,
        }
    }

    pub fn delete(&mut self, id: AllocationId) {
        self.free_list.delete(id);
    }

    /// Destroys every resource still living in the region, then the region.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        let leftovers = self.free_list.drain();
        if !leftovers.is_empty() {
            log::debug!(
                "{:?} memory block: destroying {} remaining allocations",
                self.memory_type,
                leftovers.len()
            );
        }

        unsafe {
            for header in leftovers {
                match header.owner {
                    ResourceHandle::Buffer(buffer) => device.device.destroy_buffer(buffer, None),
                    ResourceHandle::Image(image) => device.device.destroy_image(image, None),
                }
            }

            self.unmap(device);
            device.device.free_memory(self.memory, None);
        }

        self.memory = vk::DeviceMemory::null();
    }
}
