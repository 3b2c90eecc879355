// Mesh loading and drawing
//
// Import produces a flat vertex/index stream in the file's own conventions;
// `prepare_vertices` converts it to Y-up / top-left UVs and joins duplicate
// vertices before the upload to device local memory.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::backend::allocator::Allocator;
use crate::backend::buffer::Buffer;
use crate::backend::memory::MemoryType;
use crate::backend::VulkanDevice;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub tex_coord: Vec2,
}

impl Vertex {
    pub fn binding_descriptions() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, normal) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 2,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, tex_coord) as u32,
            },
        ]
    }

    /// Bit pattern of every component, for exact duplicate detection
    fn key(&self) -> [u32; 8] {
        [
            self.position.x.to_bits(),
            self.position.y.to_bits(),
            self.position.z.to_bits(),
            self.normal.x.to_bits(),
            self.normal.y.to_bits(),
            self.normal.z.to_bits(),
            self.tex_coord.x.to_bits(),
            self.tex_coord.y.to_bits(),
        ]
    }
}

/// Which axis points up in the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpAxis {
    Y,
    /// Z up, Y forward
    Z,
}

/// Where texture coordinate (0, 0) sits in the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UvOrigin {
    TopLeft,
    BottomLeft,
}

/// Triangle list as read from a file, before any conversion
#[derive(Debug, Clone)]
pub struct ImportedMesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub tex_coords: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    /// Diffuse or base color texture, resolved against the file's directory
    pub albedo: Option<PathBuf>,
    pub up_axis: UpAxis,
    pub uv_origin: UvOrigin,
}

pub trait MeshImporter {
    fn import(&self, path: &Path) -> Result<ImportedMesh>;
}

/// glTF 2.0 (.gltf / .glb). Every mesh instance of the default scene is
/// flattened into one triangle list with node transforms applied.
pub struct GltfImporter;

impl MeshImporter for GltfImporter {
    fn import(&self, path: &Path) -> Result<ImportedMesh> {
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));

        // Buffers only: textures are decoded later through the texture cache
        let gltf::Gltf { document, blob } =
            gltf::Gltf::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let buffers = gltf::import_buffers(&document, Some(base_dir), blob)
            .with_context(|| format!("Failed to load buffers of {:?}", path))?;
        let mut mesh = ImportedMesh {
            positions: Vec::new(),
            normals: Vec::new(),
            tex_coords: Vec::new(),
            indices: Vec::new(),
            albedo: None,
            // glTF is always Y up with a top-left UV origin
            up_axis: UpAxis::Y,
            uv_origin: UvOrigin::TopLeft,
        };

        let scene = document
            .default_scene()
            .or_else(|| document.scenes().next())
            .context("glTF file has no scene")?;

        let mut stack: Vec<(gltf::Node, Mat4)> =
            scene.nodes().map(|node| (node, Mat4::IDENTITY)).collect();

        while let Some((node, parent)) = stack.pop() {
            let transform = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

            if let Some(node_mesh) = node.mesh() {
                for primitive in node_mesh.primitives() {
                    append_primitive(&mut mesh, &primitive, &buffers, transform, base_dir)?;
                }
            }

            stack.extend(node.children().map(|child| (child, transform)));
        }

        anyhow::ensure!(!mesh.indices.is_empty(), "{:?} contains no triangles", path);
        Ok(mesh)
    }
}

fn append_primitive(
    mesh: &mut ImportedMesh,
    primitive: &gltf::Primitive,
    buffers: &[gltf::buffer::Data],
    transform: Mat4,
    base_dir: &Path,
) -> Result<()> {
    let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));

    let Some(positions) = reader.read_positions() else {
        log::warn!("Skipping primitive {} without positions", primitive.index());
        return Ok(());
    };

    let base = mesh.positions.len() as u32;
    let normal_matrix = transform.inverse().transpose();

    let positions: Vec<[f32; 3]> = positions
        .map(|p| transform.transform_point3(Vec3::from(p)).to_array())
        .collect();
    let count = positions.len();

    let normals: Vec<[f32; 3]> = match reader.read_normals() {
        Some(normals) => normals
            .map(|n| {
                normal_matrix
                    .transform_vector3(Vec3::from(n))
                    .normalize_or_zero()
                    .to_array()
            })
            .collect(),
        None => vec![[0.0; 3]; count],
    };

    let tex_coords: Vec<[f32; 2]> = match reader.read_tex_coords(0) {
        Some(coords) => coords.into_f32().collect(),
        None => vec![[0.0; 2]; count],
    };

    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..count as u32).collect(),
    };

    let triangles = match primitive.mode() {
        gltf::mesh::Mode::Triangles => indices,
        gltf::mesh::Mode::TriangleStrip => triangulate_strip(&indices),
        gltf::mesh::Mode::TriangleFan => triangulate_fan(&indices),
        other => {
            log::warn!("Skipping primitive {} with mode {:?}", primitive.index(), other);
            return Ok(());
        }
    };

    mesh.positions.extend(positions);
    mesh.normals.extend(normals);
    mesh.tex_coords.extend(tex_coords);
    mesh.indices.extend(triangles.into_iter().map(|i| i + base));

    if mesh.albedo.is_none() {
        mesh.albedo = albedo_texture(&primitive.material(), base_dir);
    }

    Ok(())
}

/// Diffuse texture of a specular-glossiness material, else the base color
/// texture. Embedded images are not supported.
fn albedo_texture(material: &gltf::Material, base_dir: &Path) -> Option<PathBuf> {
    let info = material
        .pbr_specular_glossiness()
        .and_then(|pbr| pbr.diffuse_texture())
        .or_else(|| material.pbr_metallic_roughness().base_color_texture())?;

    match info.texture().source().source() {
        gltf::image::Source::Uri { uri, .. } => Some(base_dir.join(uri)),
        gltf::image::Source::View { .. } => {
            log::warn!(
                "Material {} uses an embedded texture, which is not supported",
                material.name().unwrap_or("<unnamed>")
            );
            None
        }
    }
}

fn triangulate_strip(indices: &[u32]) -> Vec<u32> {
    indices
        .windows(3)
        .enumerate()
        .flat_map(|(i, w)| if i % 2 == 0 { [w[0], w[1], w[2]] } else { [w[1], w[0], w[2]] })
        .collect()
}

fn triangulate_fan(indices: &[u32]) -> Vec<u32> {
    match indices.split_first() {
        Some((&center, rest)) => rest
            .windows(2)
            .flat_map(|w| [center, w[0], w[1]])
            .collect(),
        None => Vec::new(),
    }
}

/// Converts to Y-up, top-left UVs
pub fn convert_vertices(mesh: &ImportedMesh) -> Vec<Vertex> {
    let axis = |v: [f32; 3]| match mesh.up_axis {
        UpAxis::Y => Vec3::from(v),
        UpAxis::Z => Vec3::new(v[0], v[2], -v[1]),
    };

    mesh.positions
        .iter()
        .enumerate()
        .map(|(i, &position)| {
            let normal = mesh.normals.get(i).copied().unwrap_or_default();
            let [u, v] = mesh.tex_coords.get(i).copied().unwrap_or_default();
            let v = match mesh.uv_origin {
                UvOrigin::TopLeft => v,
                UvOrigin::BottomLeft => 1.0 - v,
            };

            Vertex {
                position: axis(position),
                normal: axis(normal),
                tex_coord: Vec2::new(u, v),
            }
        })
        .collect()
}

/// Collapses bit-identical vertices and remaps the indices
pub fn join_identical_vertices(vertices: &[Vertex], indices: &[u32]) -> (Vec<Vertex>, Vec<u32>) {
    let mut unique = Vec::with_capacity(vertices.len());
    let mut seen: HashMap<[u32; 8], u32> = HashMap::with_capacity(vertices.len());

    let remap: Vec<u32> = vertices
        .iter()
        .map(|vertex| {
            *seen.entry(vertex.key()).or_insert_with(|| {
                unique.push(*vertex);
                unique.len() as u32 - 1
            })
        })
        .collect();

    let indices = indices.iter().map(|&i| remap[i as usize]).collect();
    (unique, indices)
}

pub struct Mesh {
    pub name: String,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    pub index_count: u32,
    /// Slot in the texture cache
    pub texture: u32,
    pub albedo: Option<PathBuf>,
}

impl Mesh {
    /// Imports, converts and uploads a mesh. `up_axis`/`uv_origin` override
    /// what the importer reports.
    pub fn load(
        allocator: &mut dyn Allocator,
        importer: &dyn MeshImporter,
        path: &Path,
        up_axis: Option<UpAxis>,
        uv_origin: Option<UvOrigin>,
    ) -> Result<Self> {
        let mut imported = importer.import(path)?;
        imported.up_axis = up_axis.unwrap_or(imported.up_axis);
        imported.uv_origin = uv_origin.unwrap_or(imported.uv_origin);

        if let Some(&bad) = imported
            .indices
            .iter()
            .find(|&&i| i as usize >= imported.positions.len())
        {
            anyhow::bail!(
                "{:?}: index {} out of range for {} vertices",
                path,
                bad,
                imported.positions.len()
            );
        }

        let vertices = convert_vertices(&imported);
        let (vertices, indices) = join_identical_vertices(&vertices, &imported.indices);

        log::info!(
            "Loaded mesh {:?}: {} vertices, {} triangles",
            path,
            vertices.len(),
            indices.len() / 3
        );

        let vertex_buffer = upload(
            allocator,
            bytemuck::cast_slice(&vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = match upload(
            allocator,
            bytemuck::cast_slice(&indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                allocator.free_buffer(vertex_buffer);
                return Err(e);
            }
        };

        Ok(Self {
            name: path.display().to_string(),
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            texture: 0,
            albedo: imported.albedo,
        })
    }

    pub fn draw(&self, device: &VulkanDevice, cmd: vk::CommandBuffer) {
        unsafe {
            device
                .device
                .cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.handle], &[0]);
            device.device.cmd_bind_index_buffer(
                cmd,
                self.index_buffer.handle,
                0,
                vk::IndexType::UINT32,
            );
            device
                .device
                .cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }

    pub fn destroy(self, allocator: &mut dyn Allocator) {
        allocator.free_buffer(self.vertex_buffer);
        allocator.free_buffer(self.index_buffer);
    }
}

/// Device local buffer filled through the staging path
fn upload(
    allocator: &mut dyn Allocator,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<Buffer> {
    let mut buffer = allocator.create_buffer(
        bytes.len() as vk::DeviceSize,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
    )?;

    let result = match allocator.allocate_buffer(&mut buffer, MemoryType::Local) {
        Ok(true) => allocator.upload_buffer(&buffer, bytes),
        Ok(false) => Err(anyhow::anyhow!(
            "Out of device local memory for a {} byte buffer",
            bytes.len()
        )),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => Ok(buffer),
        Err(e) => {
            allocator.free_buffer(buffer);
            Err(e)
        }
    }
}
