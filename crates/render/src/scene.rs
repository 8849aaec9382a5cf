//! Render-data seam: turns (Transform, MeshHandle) pairs into draw items.

use glam::Mat4;
use playground_common::{MeshHandle, Transform};
use playground_ecs::{EcsError, Entity, Query, Read, Render, World};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Index range of one mesh inside the shared geometry buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshInfo {
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
}

/// Named meshes known to a renderer.
#[derive(Debug, Clone, Default)]
pub struct MeshTable {
    meshes: Vec<MeshInfo>,
    names: HashMap<String, MeshHandle>,
}

impl MeshTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `info` under `name`; re-registering a name replaces its
    /// info and keeps the handle.
    pub fn insert(&mut self, name: impl Into<String>, info: MeshInfo) -> MeshHandle {
        let name = name.into();
        if let Some(&handle) = self.names.get(&name) {
            self.meshes[handle.0 as usize] = info;
            return handle;
        }
        let handle = MeshHandle(self.meshes.len() as u32);
        self.meshes.push(info);
        self.names.insert(name, handle);
        handle
    }

    pub fn get(&self, handle: MeshHandle) -> Option<&MeshInfo> {
        self.meshes.get(handle.0 as usize)
    }

    pub fn lookup(&self, name: &str) -> Option<MeshHandle> {
        self.names.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

/// Per-frame values supplied by the frame loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameContext {
    pub view_proj: Mat4,
    pub frame: u64,
    pub delta_seconds: f32,
}

impl Default for FrameContext {
    fn default() -> Self {
        Self {
            view_proj: Mat4::IDENTITY,
            frame: 0,
            delta_seconds: 0.0,
        }
    }
}

/// One indexed draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    pub entity: Entity,
    pub model: Mat4,
    pub mvp: Mat4,
    pub mesh: MeshHandle,
}

/// Query data every drawable entity matches.
pub type DrawData = (Read<Transform>, Read<MeshHandle>);

/// Lazily map matching entities to draw items, in ascending slot order.
pub fn draw_items<'a, 'w>(
    query: &'a mut Query<'w, DrawData>,
    view_proj: Mat4,
) -> impl Iterator<Item = DrawItem> + 'a {
    query.iter().map(move |(entity, (transform, mesh))| {
        let model = transform.model_matrix();
        DrawItem {
            entity,
            model,
            mvp: view_proj * model,
            mesh: *mesh,
        }
    })
}

pub fn collect_draws(world: &World, view_proj: Mat4) -> Result<Vec<DrawItem>, EcsError> {
    let mut query = world.query::<DrawData>()?;
    Ok(draw_items(&mut query, view_proj).collect())
}

#[derive(Debug, Default)]
struct DrawListState {
    view_proj: Mat4,
    frame: u64,
    items: Vec<DrawItem>,
}

/// Frame-local draw sink filled by a `Render` schedule system.
///
/// Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct DrawList {
    state: Rc<RefCell<DrawListState>>,
}

impl DrawList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the list and set the matrices for the coming `Render` run.
    pub fn begin(&self, frame: &FrameContext) {
        let mut state = self.state.borrow_mut();
        state.view_proj = frame.view_proj;
        state.frame = frame.frame;
        state.items.clear();
    }

    pub fn take(&self) -> Vec<DrawItem> {
        std::mem::take(&mut self.state.borrow_mut().items)
    }

    pub fn len(&self) -> usize {
        self.state.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frame(&self) -> u64 {
        self.state.borrow().frame
    }

    /// Add the collecting system to `world`'s `Render` schedule.
    pub fn register(&self, world: &World) {
        let list = self.clone();
        world.add_system::<Render, DrawData>(move |mut query| {
            let mut state = list.state.borrow_mut();
            let view_proj = state.view_proj;
            state.items.extend(draw_items(&mut query, view_proj));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn world_with_three() -> (World, [Entity; 3]) {
        let world = World::new();
        let a = world
            .spawn()
            .with(Transform::from_position(Vec3::new(1.0, 0.0, 0.0)))
            .unwrap()
            .with(MeshHandle(0))
            .unwrap()
            .id();
        let b = world
            .spawn()
            .with(Transform::from_position(Vec3::new(0.0, 2.0, 0.0)))
            .unwrap()
            .with(MeshHandle(1))
            .unwrap()
            .id();
        let c = world.spawn().with(Transform::default()).unwrap().id();
        (world, [a, b, c])
    }

    #[test]
    fn only_entities_with_both_components_draw() {
        let (world, [a, b, _c]) = world_with_three();
        let draws = collect_draws(&world, Mat4::IDENTITY).unwrap();
        let entities: Vec<Entity> = draws.iter().map(|d| d.entity).collect();
        assert_eq!(entities, vec![a, b]);
        assert_eq!(draws[1].mesh, MeshHandle(1));
    }

    #[test]
    fn mvp_composes_view_projection_with_model() {
        let (world, _) = world_with_three();
        let vp = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        let draws = collect_draws(&world, vp).unwrap();
        let origin = draws[0].mvp.transform_point3(Vec3::ZERO);
        assert!((origin - Vec3::new(1.0, 0.0, -5.0)).length() < 1e-5);
        assert_eq!(draws[0].model, Mat4::from_translation(Vec3::X));
    }

    #[test]
    fn draw_list_collects_through_render_schedule() {
        let (world, [a, b, _]) = world_with_three();
        let list = DrawList::new();
        list.register(&world);

        for frame in 1..=2 {
            list.begin(&FrameContext {
                frame,
                ..FrameContext::default()
            });
            world.run_schedule::<Render>().unwrap();
            assert_eq!(list.frame(), frame);
            assert_eq!(list.len(), 2);
        }
        world.destroy(a).unwrap();
        list.begin(&FrameContext::default());
        world.run_schedule::<Render>().unwrap();
        let items = list.take();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].entity, b);
        assert!(list.is_empty());
    }

    #[test]
    fn mesh_table_reuses_handles_by_name() {
        let mut table = MeshTable::new();
        let cube = table.insert(
            "cube",
            MeshInfo {
                index_count: 36,
                first_index: 0,
                base_vertex: 0,
            },
        );
        let plane = table.insert(
            "plane",
            MeshInfo {
                index_count: 6,
                first_index: 36,
                base_vertex: 24,
            },
        );
        assert_ne!(cube, plane);
        let again = table.insert(
            "cube",
            MeshInfo {
                index_count: 12,
                first_index: 0,
                base_vertex: 0,
            },
        );
        assert_eq!(again, cube);
        assert_eq!(table.get(cube).unwrap().index_count, 12);
        assert_eq!(table.lookup("plane"), Some(plane));
        assert_eq!(table.len(), 2);
        assert!(table.get(MeshHandle(9)).is_none());
    }
}
