pub mod disk;
pub mod volume;

pub use disk::{ensure_instance_disk, remove_instance_dir, DiskMetadata};
pub use volume::{ensure_volume_exists, plan_mounts, MountPlan, ResolvedMount, VolumeMetadata};
