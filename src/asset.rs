// Asset loading
//
// Image decoding and the texture cache. Textures are keyed by path so a file
// referenced by several meshes is uploaded once; the slot index doubles as the
// element of the shader's texture array.

use anyhow::{Context, Result};
use ash::vk;
use std::path::{Path, PathBuf};

use crate::backend::allocator::Allocator;
use crate::backend::texture::Texture;

/// Tightly packed RGBA8 pixels
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    /// 1x1 image of a single color
    pub fn solid(rgba: [u8; 4]) -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: rgba.to_vec(),
        }
    }
}

pub fn decode_image(path: &Path) -> Result<DecodedImage> {
    let image = image::open(path)
        .with_context(|| format!("Failed to decode image {:?}", path))?
        .to_rgba8();

    Ok(DecodedImage {
        width: image.width(),
        height: image.height(),
        pixels: image.into_raw(),
    })
}

pub type TextureId = u32;

#[derive(Debug)]
pub struct CachedTexture {
    pub path: PathBuf,
    pub texture: Texture,
    pub view: vk::ImageView,
}

pub struct TextureCache {
    slots: Vec<Option<CachedTexture>>,
}

impl TextureCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: TextureId) -> Option<&CachedTexture> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    pub fn find(&self, path: &Path) -> Option<TextureId> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|cached| cached.path == path))
            .map(|index| index as TextureId)
    }

    /// Stores an already created texture in the first free slot
    pub fn insert(&mut self, path: PathBuf, texture: Texture, view: vk::ImageView) -> Result<TextureId> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .with_context(|| {
                format!("Texture cache is full ({} slots), cannot add {:?}", self.capacity(), path)
            })?;

        self.slots[index] = Some(CachedTexture {
            path,
            texture,
            view,
        });
        Ok(index as TextureId)
    }

    /// Returns the slot holding `path`, loading it on first use
    pub fn request(&mut self, allocator: &mut dyn Allocator, path: &Path) -> Result<TextureId> {
        if let Some(id) = self.find(path) {
            log::debug!("Texture cache hit: {:?} -> {}", path, id);
            return Ok(id);
        }

        if self.slots.iter().all(Option::is_some) {
            anyhow::bail!(
                "Texture cache is full ({} slots), cannot load {:?}",
                self.capacity(),
                path
            );
        }

        let texture = allocator.load_image(
            path,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageUsageFlags::SAMPLED,
        )?;
        let view = match allocator.create_image_view(&texture, vk::ImageAspectFlags::COLOR) {
            Ok(view) => view,
            Err(e) => {
                allocator.free_texture(texture);
                return Err(e);
            }
        };

        self.insert(path.to_path_buf(), texture, view)
    }

    /// Frees the texture loaded from `path`. Returns the slot it occupied.
    pub fn unload(&mut self, allocator: &mut dyn Allocator, path: &Path) -> Option<TextureId> {
        let id = self.find(path)?;
        if let Some(cached) = self.slots[id as usize].take() {
            allocator.destroy_image_view(cached.view);
            allocator.free_texture(cached.texture);
        }
        Some(id)
    }

    pub fn clear(&mut self, allocator: &mut dyn Allocator) {
        for cached in self.slots.iter_mut().filter_map(Option::take) {
            allocator.destroy_image_view(cached.view);
            allocator.free_texture(cached.texture);
        }
    }
}
