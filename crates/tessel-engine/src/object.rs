//! Dynamic objects: positioned, simulated entities inside a region.
//!
//! Object behaviour is a closed set of tagged variants plus one
//! extension point, [`ObjectBehavior`], dispatched through a single
//! update hook per tick.

use std::fmt;

use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessel_core::{ObjectId, RegionCoord, SimulationFault, TickId, Vec3};

use crate::context::UpdateContext;
use crate::handle::{Publish, SafeHandle};

/// An object behind its safe handle.
pub type ObjectHandle = SafeHandle<DynamicObject>;

/// Downward acceleration per tick for creatures.
pub const CREATURE_GRAVITY: f64 = 0.08;

/// Horizontal velocity multiplier per tick for idle creatures.
pub const CREATURE_DRAG: f64 = 0.91;

/// Downward acceleration per tick for dropped items.
pub const ITEM_GRAVITY: f64 = 0.04;

/// Horizontal velocity multiplier per tick for airborne items.
pub const ITEM_AIR_DRAG: f64 = 0.98;

/// Horizontal velocity multiplier per tick for items resting on ground.
pub const ITEM_GROUND_FRICTION: f64 = 0.6;

/// Ticks before a dropped item can be picked up.
pub const DEFAULT_PICKUP_DELAY: u64 = 10;

/// Ticks before a dropped item despawns (five minutes at 20 Hz).
pub const DEFAULT_ITEM_LIFETIME: u64 = 6000;

/// Motion and bookkeeping shared by every object kind.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectState {
    /// World position.
    pub position: Vec3,
    /// Displacement per tick.
    pub velocity: Vec3,
    /// Whether the object rested on terrain after its last update.
    pub on_ground: bool,
    age_ticks: u64,
    removal_requested: bool,
}

impl ObjectState {
    fn new(position: Vec3, velocity: Vec3) -> Self {
        Self {
            position,
            velocity,
            on_ground: false,
            age_ticks: 0,
            removal_requested: false,
        }
    }

    /// Updates this object has run.
    pub fn age_ticks(&self) -> u64 {
        self.age_ticks
    }

    /// Ask for removal at the next tick boundary.
    pub fn request_removal(&mut self) {
        self.removal_requested = true;
    }

    /// Whether removal has been requested.
    pub fn removal_requested(&self) -> bool {
        self.removal_requested
    }

    /// Integrate velocity and settle on the ground if it was reached.
    fn integrate(&mut self, gravity: f64, ctx: &UpdateContext<'_>) {
        self.velocity.y -= gravity;
        self.position = self.position + self.velocity;
        match ctx.ground_height(self.position) {
            Some(ground) if self.position.y <= ground => {
                self.position.y = ground;
                self.velocity.y = 0.0;
                self.on_ground = true;
            }
            _ => self.on_ground = false,
        }
    }
}

/// User-defined object behaviour.
pub trait ObjectBehavior: Send + 'static {
    /// Short label, shown in views and logs.
    fn name(&self) -> &str;

    /// Advance one tick. Errors and panics are isolated to this object.
    fn update(
        &mut self,
        state: &mut ObjectState,
        ctx: &UpdateContext<'_>,
    ) -> Result<(), SimulationFault>;
}

/// Periodic random walking.
#[derive(Clone)]
pub struct Wander {
    rng: ChaCha8Rng,
    speed: f64,
    interval: u64,
}

impl Wander {
    /// Pick a new heading every `interval` ticks, deterministic per seed.
    pub fn new(seed: u64, speed: f64, interval: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            speed,
            interval: interval.max(1),
        }
    }

    fn heading(&mut self) -> Vec3 {
        let angle = f64::from(self.rng.next_u32()) / f64::from(u32::MAX) * std::f64::consts::TAU;
        Vec3::new(angle.cos() * self.speed, 0.0, angle.sin() * self.speed)
    }
}

impl fmt::Debug for Wander {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wander")
            .field("speed", &self.speed)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// A living object with health.
#[derive(Clone, Debug)]
pub struct CreatureState {
    /// Current health; removal is requested at zero.
    pub health: f32,
    /// Health cap.
    pub max_health: f32,
    /// Random walk, if any.
    pub wander: Option<Wander>,
}

impl CreatureState {
    fn update(&mut self, state: &mut ObjectState, ctx: &UpdateContext<'_>) {
        if self.health <= 0.0 {
            state.request_removal();
            return;
        }
        match self.wander.as_mut() {
            Some(w) if (state.age_ticks - 1) % w.interval == 0 => {
                let heading = w.heading();
                state.velocity.x = heading.x;
                state.velocity.z = heading.z;
            }
            Some(_) => {}
            None => {
                state.velocity.x *= CREATURE_DRAG;
                state.velocity.z *= CREATURE_DRAG;
            }
        }
        state.integrate(CREATURE_GRAVITY, ctx);
    }
}

/// What a dropped item carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemStack {
    /// Material id, opaque to the engine.
    pub material: u32,
    /// Stack size.
    pub amount: u8,
}

/// A dropped item lying in (or falling through) the world.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemState {
    /// The stack.
    pub stack: ItemStack,
    /// Ticks before pickup is allowed.
    pub pickup_delay: u64,
    /// Ticks before despawn.
    pub lifetime: u64,
}

impl ItemState {
    /// An item with default pickup delay and lifetime.
    pub fn new(stack: ItemStack) -> Self {
        Self {
            stack,
            pickup_delay: DEFAULT_PICKUP_DELAY,
            lifetime: DEFAULT_ITEM_LIFETIME,
        }
    }

    fn update(&mut self, state: &mut ObjectState, ctx: &UpdateContext<'_>) {
        if state.age_ticks >= self.lifetime {
            state.request_removal();
            return;
        }
        state.integrate(ITEM_GRAVITY, ctx);
        let friction = if state.on_ground {
            ITEM_GROUND_FRICTION
        } else {
            ITEM_AIR_DRAG
        };
        state.velocity.x *= friction;
        state.velocity.z *= friction;
    }
}

/// The behaviour variant of an object.
pub enum ObjectKind {
    /// A creature.
    Creature(CreatureState),
    /// A dropped item.
    DroppedItem(ItemState),
    /// Anything else.
    Custom(Box<dyn ObjectBehavior>),
}

impl fmt::Debug for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creature(c) => f.debug_tuple("Creature").field(c).finish(),
            Self::DroppedItem(i) => f.debug_tuple("DroppedItem").field(i).finish(),
            Self::Custom(b) => f.debug_tuple("Custom").field(&b.name()).finish(),
        }
    }
}

/// Everything needed to spawn an object.
#[derive(Debug)]
pub struct ObjectSpec {
    /// Initial position; decides the initial region.
    pub position: Vec3,
    /// Initial velocity.
    pub velocity: Vec3,
    /// Behaviour.
    pub kind: ObjectKind,
}

impl ObjectSpec {
    /// A stationary creature at full health.
    pub fn creature(position: Vec3, max_health: f32) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            kind: ObjectKind::Creature(CreatureState {
                health: max_health,
                max_health,
                wander: None,
            }),
        }
    }

    /// A creature that random-walks, re-rolling its heading every 20 ticks.
    pub fn wandering_creature(position: Vec3, max_health: f32, seed: u64, speed: f64) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            kind: ObjectKind::Creature(CreatureState {
                health: max_health,
                max_health,
                wander: Some(Wander::new(seed, speed, 20)),
            }),
        }
    }

    /// A dropped item with default timings.
    pub fn item(position: Vec3, stack: ItemStack) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            kind: ObjectKind::DroppedItem(ItemState::new(stack)),
        }
    }

    /// An object driven by a custom behaviour.
    pub fn custom(position: Vec3, behavior: impl ObjectBehavior) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            kind: ObjectKind::Custom(Box::new(behavior)),
        }
    }

    /// Override the initial velocity.
    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }
}

/// A simulated entity.
#[derive(Debug)]
pub struct DynamicObject {
    id: ObjectId,
    region: RegionCoord,
    state: ObjectState,
    kind: ObjectKind,
}

impl DynamicObject {
    /// Build an object from its spawn spec. The region is the one
    /// containing the spawn position.
    pub fn new(id: ObjectId, spec: ObjectSpec) -> Self {
        Self {
            id,
            region: RegionCoord::containing(spec.position),
            state: ObjectState::new(spec.position, spec.velocity),
            kind: spec.kind,
        }
    }

    /// This object's id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The region this object is a member of.
    ///
    /// Changes only at a tick boundary, so it may lag behind
    /// `RegionCoord::containing(position)` for the rest of a tick.
    pub fn region(&self) -> RegionCoord {
        self.region
    }

    pub(crate) fn set_region(&mut self, region: RegionCoord) {
        self.region = region;
    }

    /// Current position.
    pub fn position(&self) -> Vec3 {
        self.state.position
    }

    /// Current velocity, in blocks per tick.
    pub fn velocity(&self) -> Vec3 {
        self.state.velocity
    }

    /// Ticks simulated since the object joined the world.
    pub fn age_ticks(&self) -> u64 {
        self.state.age_ticks
    }

    /// Whether the object asked to be removed at the next boundary.
    pub fn removal_requested(&self) -> bool {
        self.state.removal_requested
    }

    /// The behaviour variant.
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Motion and lifecycle state shared by every kind.
    pub fn state(&self) -> &ObjectState {
        &self.state
    }

    /// Mutable motion state, for teleports and knockback from outside
    /// the simulation.
    pub fn state_mut(&mut self) -> &mut ObjectState {
        &mut self.state
    }

    /// Apply damage. Returns `false` for kinds without health.
    pub fn damage(&mut self, amount: f32) -> bool {
        match &mut self.kind {
            ObjectKind::Creature(c) => {
                c.health = (c.health - amount).max(0.0);
                true
            }
            _ => false,
        }
    }

    /// Whether a dropped item may be picked up yet.
    pub fn is_pickable(&self) -> bool {
        match &self.kind {
            ObjectKind::DroppedItem(i) => self.state.age_ticks >= i.pickup_delay,
            _ => false,
        }
    }

    /// Advance one tick.
    ///
    /// Objects already marked for removal are left untouched. If an
    /// update leaves the motion state non-finite, it is rolled back and
    /// a fault is returned.
    pub fn update(&mut self, ctx: &UpdateContext<'_>) -> Result<(), SimulationFault> {
        if self.state.removal_requested {
            return Ok(());
        }
        let (position, velocity) = (self.state.position, self.state.velocity);
        self.state.age_ticks += 1;

        let result = match &mut self.kind {
            ObjectKind::Creature(c) => {
                c.update(&mut self.state, ctx);
                Ok(())
            }
            ObjectKind::DroppedItem(i) => {
                i.update(&mut self.state, ctx);
                Ok(())
            }
            ObjectKind::Custom(b) => b.update(&mut self.state, ctx),
        };

        if !self.state.position.is_finite() || !self.state.velocity.is_finite() {
            self.state.position = position;
            self.state.velocity = velocity;
            return Err(SimulationFault::Update {
                reason: format!("object {}: non-finite motion", self.id),
            });
        }
        result
    }
}

/// Behaviour-specific part of an [`ObjectView`].
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectViewKind {
    /// A creature.
    Creature {
        /// Current health.
        health: f32,
        /// Health cap.
        max_health: f32,
    },
    /// A dropped item.
    DroppedItem {
        /// The stack.
        stack: ItemStack,
        /// Whether pickup is allowed.
        pickable: bool,
    },
    /// A custom behaviour.
    Custom {
        /// The behaviour's name.
        name: String,
    },
}

/// Immutable published state of one object.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectView {
    /// Object id.
    pub id: ObjectId,
    /// Kind-specific details.
    pub kind: ObjectViewKind,
    /// Position at publish time.
    pub position: Vec3,
    /// Velocity at publish time.
    pub velocity: Vec3,
    /// Region membership at publish time.
    pub region: RegionCoord,
    /// Updates run so far.
    pub age_ticks: u64,
    /// Pending removal.
    pub removal_requested: bool,
    /// Tick at which this view was published.
    pub generation: TickId,
}

impl Publish for DynamicObject {
    type View = ObjectView;

    fn view(&self, generation: TickId) -> ObjectView {
        let kind = match &self.kind {
            ObjectKind::Creature(c) => ObjectViewKind::Creature {
                health: c.health,
                max_health: c.max_health,
            },
            ObjectKind::DroppedItem(i) => ObjectViewKind::DroppedItem {
                stack: i.stack,
                pickable: self.is_pickable(),
            },
            ObjectKind::Custom(b) => ObjectViewKind::Custom {
                name: b.name().to_owned(),
            },
        };
        ObjectView {
            id: self.id,
            kind,
            position: self.state.position,
            velocity: self.state.velocity,
            region: self.region,
            age_ticks: self.state.age_ticks,
            removal_requested: self.state.removal_requested,
            generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TickContext;
    use crate::region::{DEFAULT_GROUND, REGION_CELLS};

    fn flat() -> Vec<u16> {
        vec![DEFAULT_GROUND; REGION_CELLS]
    }

    fn step(obj: &mut DynamicObject, terrain: &[u16], tick: u64) -> Result<(), SimulationFault> {
        let t = TickContext::new(TickId(tick), 0);
        let ctx = UpdateContext::new(&t, obj.region(), terrain);
        obj.update(&ctx)
    }

    #[test]
    fn item_falls_to_ground_and_despawns() {
        let terrain = flat();
        let mut spec = ObjectSpec::item(
            Vec3::new(4.0, 70.0, 4.0),
            ItemStack {
                material: 1,
                amount: 3,
            },
        );
        if let ObjectKind::DroppedItem(i) = &mut spec.kind {
            i.lifetime = 200;
        }
        let mut obj = DynamicObject::new(ObjectId(1), spec);
        assert!(!obj.is_pickable());

        for t in 1..=100 {
            step(&mut obj, &terrain, t).unwrap();
        }
        assert_eq!(obj.position().y, f64::from(DEFAULT_GROUND));
        assert!(obj.state().on_ground);
        assert!(obj.is_pickable());
        assert!(!obj.removal_requested());

        for t in 101..=201 {
            step(&mut obj, &terrain, t).unwrap();
        }
        assert!(obj.removal_requested());
        let age = obj.age_ticks();
        step(&mut obj, &terrain, 202).unwrap();
        assert_eq!(obj.age_ticks(), age, "removed objects are not updated");
    }

    #[test]
    fn creature_drag_slows_and_zero_health_removes() {
        let terrain = flat();
        let spec = ObjectSpec::creature(Vec3::new(1.0, 64.0, 1.0), 20.0)
            .with_velocity(Vec3::new(1.0, 0.0, 0.0));
        let mut obj = DynamicObject::new(ObjectId(2), spec);
        step(&mut obj, &terrain, 1).unwrap();
        assert!(obj.velocity().x < 1.0);
        assert!(obj.position().x > 1.0);
        assert!(obj.state().on_ground);

        assert!(obj.damage(25.0));
        step(&mut obj, &terrain, 2).unwrap();
        assert!(obj.removal_requested());
        match obj.view(TickId(2)).kind {
            ObjectViewKind::Creature { health, .. } => assert_eq!(health, 0.0),
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[test]
    fn wander_is_deterministic_per_seed() {
        let terrain = flat();
        let run = |seed| {
            let mut obj = DynamicObject::new(
                ObjectId(3),
                ObjectSpec::wandering_creature(Vec3::new(8.0, 64.0, 8.0), 10.0, seed, 0.1),
            );
            step(&mut obj, &terrain, 1).unwrap();
            obj.velocity()
        };
        assert_eq!(run(7), run(7));
        let v = run(7);
        assert!((v.x.hypot(v.z) - 0.1).abs() < 1e-9);
    }

    struct Explode;

    impl ObjectBehavior for Explode {
        fn name(&self) -> &str {
            "explode"
        }

        fn update(
            &mut self,
            state: &mut ObjectState,
            _ctx: &UpdateContext<'_>,
        ) -> Result<(), SimulationFault> {
            state.position.x = f64::NAN;
            Ok(())
        }
    }

    #[test]
    fn non_finite_motion_is_rolled_back() {
        let terrain = flat();
        let start = Vec3::new(2.0, 64.0, 2.0);
        let mut obj = DynamicObject::new(ObjectId(4), ObjectSpec::custom(start, Explode));
        let err = step(&mut obj, &terrain, 1).unwrap_err();
        assert!(matches!(err, SimulationFault::Update { .. }));
        assert_eq!(obj.position(), start);
        assert_eq!(
            obj.view(TickId(1)).kind,
            ObjectViewKind::Custom {
                name: "explode".into()
            }
        );
    }

    #[test]
    fn damage_ignored_by_items() {
        let mut obj = DynamicObject::new(
            ObjectId(5),
            ObjectSpec::item(
                Vec3::ZERO,
                ItemStack {
                    material: 0,
                    amount: 1,
                },
            ),
        );
        assert!(!obj.damage(1.0));
    }
}
