//! The per-application handler state.

use bitflags::bitflags;

bitflags! {
    /// The bitmask driving the online learning state machine.
    ///
    /// Most bits are independent and legitimately combine (for example
    /// `EXPLORING | BUILDING_MODEL` while a late iteration trains models as
    /// exploration winds down); `CLUELESS` and `UNDEFINED` stand alone and
    /// are only ever set with a full replace.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandlerState: u16 {
        /// Looking for previous data to load after a restart.
        const RECOVERING = 1 << 0;
        /// Just created, or reset after the last client left.
        const CLUELESS = 1 << 1;
        /// The pipeline cannot progress; clients are told to abort.
        const UNDEFINED = 1 << 2;
        /// The application description has been parsed and stored.
        const WITH_INFORMATION = 1 << 3;
        /// Design-space exploration is in progress.
        const EXPLORING = 1 << 4;
        /// The DoE plugin is producing configurations.
        const BUILDING_DOE = 1 << 5;
        /// A non-empty DoE is loaded.
        const WITH_DOE = 1 << 6;
        /// The clustering plugin is running.
        const BUILDING_CLUSTER = 1 << 7;
        /// A non-empty cluster list is loaded.
        const WITH_CLUSTER = 1 << 8;
        /// The modelling plugins are running.
        const BUILDING_MODEL = 1 << 9;
        /// Every metric has a valid model.
        const WITH_MODEL = 1 << 10;
        /// The prediction plugin is running.
        const BUILDING_PREDICTION = 1 << 11;
        /// The application knowledge is available.
        const WITH_PREDICTION = 1 << 12;

        /// Any build in flight.
        const BUILDING_ANY = Self::BUILDING_DOE.bits()
            | Self::BUILDING_CLUSTER.bits()
            | Self::BUILDING_MODEL.bits()
            | Self::BUILDING_PREDICTION.bits();
    }
}
