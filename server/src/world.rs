//! Shared model of the sector: craft, projectiles and obstacles, together
//! with the collision and projectile rules. No I/O happens here; callers
//! share a [`World`] behind [`SharedWorld`] and hold the lock for each
//! operation.

use log::{debug, info};
use serde::Serialize;
use shared::{ClientId, Entity};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type SharedWorld = Arc<RwLock<World>>;

#[derive(Debug, Clone, Copy)]
pub struct WorldConfig {
    pub width: i32,
    pub height: i32,
    pub collision_radius: f32,
    pub projectile_speed: f32,
    pub projectile_lifetime: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 1000,
            collision_radius: 20.0,
            projectile_speed: 1.0,
            projectile_lifetime: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CraftKind {
    /// Controlled by this process.
    Local,
    /// Controlled by a peer; every craft the server tracks is remote.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Craft {
    pub id: ClientId,
    pub x: f32,
    pub y: f32,
    pub heading: i32,
    pub kind: CraftKind,
}

impl Craft {
    pub fn remote(id: ClientId, x: i32, y: i32, heading: i32) -> Self {
        Self {
            id,
            x: x as f32,
            y: y as f32,
            heading,
            kind: CraftKind::Remote,
        }
    }

    pub fn local(id: ClientId, x: i32, y: i32, heading: i32) -> Self {
        Self {
            kind: CraftKind::Local,
            ..Self::remote(id, x, y, heading)
        }
    }
}

/// A torpedo in flight, keyed by the craft that fired it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Projectile {
    pub owner: ClientId,
    pub x: f32,
    pub y: f32,
    /// Degrees; 0 points along +x and 90 along +y.
    pub heading: i32,
    /// Steps taken since it was fired.
    pub age: u32,
}

impl Projectile {
    pub fn new(owner: ClientId, x: i32, y: i32, heading: i32) -> Self {
        Self {
            owner,
            x: x as f32,
            y: y as f32,
            heading,
            age: 0,
        }
    }

    fn advance(&mut self, distance: f32) {
        let radians = (self.heading as f32).to_radians();
        self.x += radians.cos() * distance;
        self.y += radians.sin() * distance;
        self.age += 1;
    }

    /// Position as sent on the wire.
    pub fn position(&self) -> (i32, i32) {
        (self.x.round() as i32, self.y.round() as i32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Obstacle {
    pub x: i32,
    pub y: i32,
}

/// Read-only copy of the world for display.
#[derive(Debug, Clone, Serialize)]
pub struct WorldSnapshot {
    pub crafts: Vec<Craft>,
    pub projectiles: Vec<Projectile>,
    pub obstacles: Vec<Obstacle>,
}

fn overlaps(ax: f32, ay: f32, bx: f32, by: f32, radius: f32) -> bool {
    let dx = bx - ax;
    let dy = by - ay;
    dx * dx + dy * dy < radius * radius
}

#[derive(Debug, Clone)]
pub struct World {
    config: WorldConfig,
    crafts: HashMap<ClientId, Craft>,
    projectiles: HashMap<ClientId, Projectile>,
    obstacles: Vec<Obstacle>,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            config,
            crafts: HashMap::new(),
            projectiles: HashMap::new(),
            obstacles: Vec::new(),
        }
    }

    pub fn into_shared(self) -> SharedWorld {
        Arc::new(RwLock::new(self))
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Inserts the craft, replacing any craft with the same id.
    pub fn upsert_craft(&mut self, craft: Craft) {
        if self.crafts.insert(craft.id, craft).is_none() {
            info!("Added craft {} at ({}, {})", craft.id, craft.x, craft.y);
        }
    }

    /// Returns false if the craft was already gone.
    pub fn remove_craft(&mut self, id: &ClientId) -> bool {
        if self.crafts.remove(id).is_some() {
            info!("Removed craft {}", id);
            true
        } else {
            false
        }
    }

    pub fn craft(&self, id: &ClientId) -> Option<&Craft> {
        self.crafts.get(id)
    }

    pub fn craft_count(&self) -> usize {
        self.crafts.len()
    }

    /// Every craft overlapping `candidate`, plus the candidate itself when
    /// anything overlaps. The stored craft sharing the candidate's id is its
    /// previous position and is not tested.
    pub fn check_collision(&self, candidate: &Craft) -> BTreeSet<Entity> {
        let radius = self.config.collision_radius;
        let mut destroyed: BTreeSet<Entity> = self
            .crafts
            .values()
            .filter(|other| other.id != candidate.id)
            .filter(|other| overlaps(candidate.x, candidate.y, other.x, other.y, radius))
            .map(|other| Entity::Craft(other.id))
            .collect();

        if !destroyed.is_empty() {
            destroyed.insert(Entity::Craft(candidate.id));
        }
        destroyed
    }

    /// Collision check and commit as one step: a colliding update removes
    /// every craft involved and is not stored, otherwise the candidate is
    /// upserted. Returns the destroyed craft.
    pub fn apply_update(&mut self, candidate: Craft) -> BTreeSet<Entity> {
        let destroyed = self.check_collision(&candidate);
        if destroyed.is_empty() {
            self.upsert_craft(candidate);
        } else {
            for entity in &destroyed {
                self.remove_craft(&entity.id());
            }
        }
        destroyed
    }

    /// Inserts the projectile, replacing one already in flight for the same owner.
    pub fn upsert_projectile(&mut self, projectile: Projectile) {
        if self
            .projectiles
            .insert(projectile.owner, projectile)
            .is_some()
        {
            debug!("Replaced projectile in flight for {}", projectile.owner);
        }
    }

    /// Returns false if the projectile was already gone.
    pub fn remove_projectile(&mut self, owner: &ClientId) -> bool {
        self.projectiles.remove(owner).is_some()
    }

    pub fn projectile(&self, owner: &ClientId) -> Option<&Projectile> {
        self.projectiles.get(owner)
    }

    pub fn projectiles(&self) -> impl Iterator<Item = &Projectile> {
        self.projectiles.values()
    }

    pub fn projectile_count(&self) -> usize {
        self.projectiles.len()
    }

    /// Advances every projectile one step and resolves what it hits.
    ///
    /// A projectile is destroyed when it reaches its lifetime, leaves the
    /// sector, or touches a craft or an obstacle. Craft it touches are
    /// destroyed with it; obstacles are not. A projectile never hits the
    /// craft that fired it. Returns everything destroyed by this step.
    pub fn step_projectiles(&mut self) -> BTreeSet<Entity> {
        let mut destroyed = BTreeSet::new();
        let radius = self.config.collision_radius;
        let owners: Vec<ClientId> = self.projectiles.keys().copied().collect();

        for owner in owners {
            let Some(projectile) = self.projectiles.get_mut(&owner) else {
                continue;
            };
            projectile.advance(self.config.projectile_speed);
            let (x, y) = (projectile.x, projectile.y);
            let expired = projectile.age >= self.config.projectile_lifetime;

            if expired || !self.in_bounds(x, y) {
                self.projectiles.remove(&owner);
                destroyed.insert(Entity::Projectile(owner));
                continue;
            }

            let hit_crafts: Vec<ClientId> = self
                .crafts
                .values()
                .filter(|craft| craft.id != owner && overlaps(x, y, craft.x, craft.y, radius))
                .map(|craft| craft.id)
                .collect();
            let hit_obstacle = self
                .obstacles
                .iter()
                .any(|o| overlaps(x, y, o.x as f32, o.y as f32, radius));

            if hit_crafts.is_empty() && !hit_obstacle {
                continue;
            }

            self.projectiles.remove(&owner);
            destroyed.insert(Entity::Projectile(owner));
            for id in hit_crafts {
                info!("Projectile from {} destroyed craft {}", owner, id);
                self.crafts.remove(&id);
                destroyed.insert(Entity::Craft(id));
            }
        }

        destroyed
    }

    pub fn add_obstacle(&mut self, x: i32, y: i32) {
        self.obstacles.push(Obstacle { x, y });
    }

    /// Obstacles in the order they were added.
    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn in_bounds(&self, x: f32, y: f32) -> bool {
        x >= 0.0 && y >= 0.0 && x < self.config.width as f32 && y < self.config.height as f32
    }

    /// True when a craft could occupy (x, y): inside the sector and clear of
    /// every obstacle. Clients use this to block movement.
    pub fn is_clear(&self, x: f32, y: f32) -> bool {
        let radius = self.config.collision_radius;
        self.in_bounds(x, y)
            && !self
                .obstacles
                .iter()
                .any(|o| overlaps(x, y, o.x as f32, o.y as f32, radius))
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            crafts: self.crafts.values().copied().collect(),
            projectiles: self.projectiles.values().copied().collect(),
            obstacles: self.obstacles.clone(),
        }
    }
}
