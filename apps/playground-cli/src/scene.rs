//! Demo scene content: a ground plane, a grid of cubes and a spin system.

use glam::{Quat, Vec3};
use playground_common::{MeshHandle, Transform};
use playground_ecs::{EcsError, Entity, Read, Update, World, Write};

/// Rotation about +Y in radians per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spin(pub f32);

/// Meshes the scene refers to.
#[derive(Debug, Clone, Copy)]
pub struct SceneMeshes {
    pub cube: MeshHandle,
    pub plane: MeshHandle,
}

/// Spawn a ground plane and `cubes` spinning cubes laid out on a square grid.
pub fn populate(world: &World, meshes: SceneMeshes, cubes: usize) -> Result<Vec<Entity>, EcsError> {
    let mut spawned = Vec::with_capacity(cubes + 1);
    spawned.push(
        world
            .spawn()
            .with(Transform::from_position(Vec3::new(0.0, -0.5, 0.0)).with_scale(Vec3::new(20.0, 1.0, 20.0)))?
            .with(meshes.plane)?
            .id(),
    );

    let side = (cubes as f32).sqrt().ceil().max(1.0) as usize;
    let offset = (side as f32 - 1.0) * 1.0;
    for i in 0..cubes {
        let (row, col) = (i / side, i % side);
        let position = Vec3::new(col as f32 * 2.0 - offset, 0.5, row as f32 * 2.0 - offset);
        let entity = world
            .spawn()
            .with(Transform::from_position(position))?
            .with(meshes.cube)?
            .with(Spin(0.5 + (i % 4) as f32 * 0.25))?
            .id();
        spawned.push(entity);
    }
    Ok(spawned)
}

/// Register the `Update` system that turns spinning entities.
pub fn register_spin(world: &World, delta_seconds: f32) {
    world.add_system::<Update, (Write<Transform>, Read<Spin>)>(move |mut query| {
        for (_, (transform, spin)) in query.iter() {
            transform.rotation = (Quat::from_rotation_y(spin.0 * delta_seconds) * transform.rotation).normalize();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use playground_render::collect_draws;

    const MESHES: SceneMeshes = SceneMeshes {
        cube: MeshHandle(0),
        plane: MeshHandle(1),
    };

    #[test]
    fn populate_spawns_plane_and_cubes() {
        let world = World::new();
        let spawned = populate(&world, MESHES, 5).unwrap();
        assert_eq!(spawned.len(), 6);
        assert_eq!(world.component_count::<Spin>(), 5);
        let draws = collect_draws(&world, glam::Mat4::IDENTITY).unwrap();
        assert_eq!(draws.len(), 6);
        assert_eq!(draws[0].mesh, MESHES.plane);
    }

    #[test]
    fn spin_rotates_only_spinning_entities() {
        let world = World::new();
        let spawned = populate(&world, MESHES, 1).unwrap();
        register_spin(&world, 1.0);
        world.run_schedule::<Update>().unwrap();

        let plane = world.try_get::<Transform>(spawned[0]).unwrap().unwrap();
        assert_eq!(plane.rotation, Quat::IDENTITY);
        drop(plane);
        let cube = world.try_get::<Transform>(spawned[1]).unwrap().unwrap();
        let expected = Quat::from_rotation_y(0.5);
        assert!(cube.rotation.angle_between(expected) < 1e-5);
    }
}
