//! The controller tag catalog.
//!
//! Every value exchanged with the PLC is a named tag with a structured node
//! path. The catalog is fixed and versioned together with the controller
//! firmware; tags are addressed by the closed [`TagId`] enumeration rather
//! than by raw path strings.

macro_rules! tag_catalog {
    ($( $(#[$meta:meta])* $name:ident => $path:literal ),+ $(,)?) => {
        /// Identifier for one tag in the agreed controller catalog.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum TagId {
            $( $(#[$meta])* $name, )+
        }

        impl TagId {
            /// Every tag in the catalog, in declaration order.
            pub const ALL: &'static [TagId] = &[ $( TagId::$name, )+ ];

            /// The structured node path for this tag.
            pub fn node_path(self) -> &'static str {
                match self {
                    $( TagId::$name => $path, )+
                }
            }

            /// Reverse lookup from a node path, for decoding change
            /// notifications delivered by the protocol layer.
            pub fn from_node(node: &str) -> Option<TagId> {
                Self::ALL.iter().copied().find(|tag| tag.node_path() == node)
            }
        }
    };
}

tag_catalog! {
    // Controller outputs (controller is the writer of record).
    /// Energy readings for the most recent pixel, one element per pulse.
    LaserPowerData => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.LaserPowerData",
    /// Pixel the gantry is currently positioned on (1-based).
    ActivePixel => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.ActivePixel",
    ReadyToConfigure => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.ReadyToConfigure",
    ReadyToTest => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.ReadyToTest",
    /// Controller-side per-pixel test status code.
    TestStatus => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.TestStatus",
    /// Commanded laser power for the pulse train in progress.
    CurrentPowerWatts => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.CurrentPowerWatts",
    MachineName => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.MachineName",
    FactoryName => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.FactoryName",
    ViablePixelList => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.ViablePixelList",
    CurrentLutId => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.CurrentLUTID",
    ConfigValid => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.ConfigValid",
    HeartbeatOut => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.HeartbeatOut",

    // Controller-issued command tags (boolean, handshake protocol).
    InitializePixel => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.InitializePixel",
    CapturePixel => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.CapturePixel",
    ProcessPixel => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.ProcessPixel",

    // Application outputs: laser test parameters.
    PulseDelayMsec => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.LaserParameters.pulseDelayMsec",
    PulseOnMsec => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.LaserParameters.pulseOnMsec",
    PulseOffMsec => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.LaserParameters.pulseOffMsec",
    NumPulsesPerLevel => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.LaserParameters.numPulsesPerLevel",
    AvailableLaserPowerWatts => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.LaserParameters.availableLaserPowerWatts",
    SafePowerLimitWatts => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.LaserParameters.safePowerLimitWatts",
    StartingPowerLevel => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.LaserParameters.startingPowerLevel",
    NumPowerLevelSteps => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.LaserParameters.numPowerLevelSteps",
    PowerLevelIncrement => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.LaserParameters.powerLevelIncrement",

    // Application outputs: test sequencing.
    PixelList => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.PixelList",
    NumPixelsToTest => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.NumPixelsToTest",
    TestPixel => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.TestPixel",
    BeginTest => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.BeginTest",
    /// Configuration rejection code published by the controller.
    ErrorNum => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.ErrorNum",
    ConfigurationSent => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.ConfigurationSent",
    TestComplete => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.TestComplete",
    ProceedToNextPixel => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.ProceedToNextPixel",
    TestType => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.TestType",
    AbortTest => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.AbortTest",
    DeleteLuts => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.DeleteLUTs",
    UploadLuts => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.UploadLUTs",
    ToleranceBandPercent => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.ToleranceBandPercent",
    HeartbeatIn => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.HeartbeatIn",

    // Application responses to command tags.
    PixelInitialized => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.PixelInitialized",
    PixelCaptured => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.PixelCaptured",
    PixelProcessed => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.PixelProcessed",
    PixelResult => "ns=6;s=::AsGlobalPV:gOpcData_FromCalibApp.PixelResult",

    // Monitor tags sampled periodically during a test.
    OpticsBoxFlow => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.OpticsBoxFlow",
    ChillerOutputTemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.ChillerOutputTemp",
    ChillerReturnTemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.ChillerReturnTemp",
    OpticsBoxFiberHolderTemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.OpticsBoxFiberHolderTemp",
    OpticsBoxMiMaSinkTemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.OpticsBoxMiMaSinkTemp",
    OpticsBoxBeamBlockATemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.OpticsBoxBeamBlockATemp",
    OpticsBoxBeamBlockBTemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.OpticsBoxBeamBlockBTemp",
    OpticsBoxBeamBlockCTemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.OpticsBoxBeamBlockCTemp",
    OpticsBoxSinkUpperTemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.OpticsBoxSinkUpperTemp",
    OpticsBoxSinkMiddleTemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.OpticsBoxSinkMiddleTemp",
    OpticsBoxSinkLowerTemp => "ns=6;s=::AsGlobalPV:gOpcData_ToCalibApp.OpticsBoxSinkLowerTemp",
}

impl std::fmt::Display for TagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
