mod record;

pub use record::{
    latest_checkpoint, list_checkpoints, load_checkpoint, load_optimizer_state, save_checkpoint,
    save_optimizer_state, CheckpointData,
};
