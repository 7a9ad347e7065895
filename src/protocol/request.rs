use std::sync::Arc;

use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    codec::{CodecError, Reader, Writer},
    marshal::{
        ClassResolver, CodeKind, Deferred, MarshalError, Marshaller, QueryArg, UnmarshalContext,
        UserCode, encode,
    },
    message::{Envelope, Message, MessageType},
};

const MESSAGE: &str = "query request";

/// Query flavour. Encoded on the wire by ordinal, so variants are only ever appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum QueryKind {
    Sql,
    Scan,
    Text,
    Spi,
    Fields,
    Set,
}

/// Slots of a request that carry user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeField {
    KeyFilter,
    ValueFilter,
    BeforeCallback,
    AfterCallback,
    ProjectionFilter,
    Reducer,
    FieldsReducer,
    Transformer,
    Visitor,
}

impl CodeField {
    pub const COUNT: usize = 9;

    pub const ALL: [CodeField; Self::COUNT] = [
        Self::KeyFilter,
        Self::ValueFilter,
        Self::BeforeCallback,
        Self::AfterCallback,
        Self::ProjectionFilter,
        Self::Reducer,
        Self::FieldsReducer,
        Self::Transformer,
        Self::Visitor,
    ];

    /// Role the class stored in this slot must declare.
    pub fn kind(self) -> CodeKind {
        match self {
            Self::KeyFilter | Self::ValueFilter | Self::ProjectionFilter | Self::Visitor => {
                CodeKind::Predicate
            }
            Self::BeforeCallback | Self::AfterCallback => CodeKind::Callback,
            Self::Reducer => CodeKind::Reducer,
            Self::FieldsReducer => CodeKind::FieldsReducer,
            Self::Transformer => CodeKind::Transformer,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Wire fields of [`QueryRequest`], in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestField {
    AfterCallback,
    AllPages,
    Arguments,
    BeforeCallback,
    ClauseArguments,
    CacheName,
    Cancel,
    Clause,
    CloneValues,
    ClassName,
    Fields,
    FieldsReducer,
    Id,
    IncludeBackups,
    IncludeMetadata,
    KeyFilter,
    PageSize,
    ProjectionFilter,
    QueryId,
    Reducer,
    Single,
    Transformer,
    Kind,
    ValueFilter,
    Visitor,
}

impl RequestField {
    pub fn name(self) -> &'static str {
        match self {
            Self::AfterCallback => "afterCallback",
            Self::AllPages => "allPages",
            Self::Arguments => "arguments",
            Self::BeforeCallback => "beforeCallback",
            Self::ClauseArguments => "clauseArguments",
            Self::CacheName => "cacheName",
            Self::Cancel => "cancel",
            Self::Clause => "clause",
            Self::CloneValues => "cloneValues",
            Self::ClassName => "className",
            Self::Fields => "fields",
            Self::FieldsReducer => "fieldsReducer",
            Self::Id => "id",
            Self::IncludeBackups => "includeBackups",
            Self::IncludeMetadata => "includeMetadata",
            Self::KeyFilter => "keyFilter",
            Self::PageSize => "pageSize",
            Self::ProjectionFilter => "projectionFilter",
            Self::QueryId => "queryId",
            Self::Reducer => "reducer",
            Self::Single => "single",
            Self::Transformer => "transformer",
            Self::Kind => "queryKind",
            Self::ValueFilter => "valueFilter",
            Self::Visitor => "visitor",
        }
    }
}

const REQUEST_FIELDS: [RequestField; 25] = [
    RequestField::AfterCallback,
    RequestField::AllPages,
    RequestField::Arguments,
    RequestField::BeforeCallback,
    RequestField::ClauseArguments,
    RequestField::CacheName,
    RequestField::Cancel,
    RequestField::Clause,
    RequestField::CloneValues,
    RequestField::ClassName,
    RequestField::Fields,
    RequestField::FieldsReducer,
    RequestField::Id,
    RequestField::IncludeBackups,
    RequestField::IncludeMetadata,
    RequestField::KeyFilter,
    RequestField::PageSize,
    RequestField::ProjectionFilter,
    RequestField::QueryId,
    RequestField::Reducer,
    RequestField::Single,
    RequestField::Transformer,
    RequestField::Kind,
    RequestField::ValueFilter,
    RequestField::Visitor,
];

type CodeSlot = Deferred<Arc<dyn UserCode>>;

/// Distributed cache query request.
///
/// One type covers three shapes:
///
/// - a full query, built with [`QueryRequest::builder`];
/// - a request for the next page of a running query, see [`QueryRequest::page_request`];
/// - a cancellation, see [`QueryRequest::cancel`].
///
/// User code is held in [`Deferred`] slots. [`prepare_marshal`](Self::prepare_marshal) turns
/// local handles into payloads before sending; on the receiving node the payloads are turned
/// back into handles on first access through [`code`](Self::code) or all at once through
/// [`finish_unmarshal`](Self::finish_unmarshal).
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    envelope: Envelope,
    id: i64,
    cache_name: Option<String>,
    query_id: i32,
    kind: Option<QueryKind>,
    fields: bool,
    clause: Option<String>,
    class_name: Option<String>,
    code: [CodeSlot; CodeField::COUNT],
    arguments: Deferred<Vec<QueryArg>>,
    clause_arguments: Option<Vec<u8>>,
    page_size: i32,
    clone_values: bool,
    include_backups: bool,
    cancel: bool,
    single: bool,
    include_metadata: bool,
    all_pages: bool,
    marshalled: bool,
}

impl PartialEq for QueryRequest {
    fn eq(&self, other: &Self) -> bool {
        self.envelope == other.envelope
            && self.id == other.id
            && self.cache_name == other.cache_name
            && self.query_id == other.query_id
            && self.kind == other.kind
            && self.fields == other.fields
            && self.clause == other.clause
            && self.class_name == other.class_name
            && self.code == other.code
            && self.arguments == other.arguments
            && self.clause_arguments == other.clause_arguments
            && self.page_size == other.page_size
            && self.clone_values == other.clone_values
            && self.include_backups == other.include_backups
            && self.cancel == other.cancel
            && self.single == other.single
            && self.include_metadata == other.include_metadata
            && self.all_pages == other.all_pages
    }
}

impl QueryRequest {
    /// Starts a full query against `cache_name`.
    pub fn builder(id: i64, cache_name: impl Into<String>) -> QueryRequestBuilder {
        QueryRequestBuilder {
            request: Self {
                id,
                cache_name: Some(cache_name.into()),
                ..Self::default()
            },
        }
    }

    /// Cancellation of the query identified by `id`.
    pub fn cancel(id: i64, fields: bool) -> Self {
        Self {
            id,
            fields,
            cancel: true,
            ..Self::default()
        }
    }

    /// Asks for the next page of an already running query.
    pub fn page_request(
        id: i64,
        cache_name: impl Into<String>,
        page_size: i32,
        clone_values: bool,
        include_backups: bool,
        fields: bool,
        all_pages: bool,
    ) -> Self {
        Self {
            id,
            cache_name: Some(cache_name.into()),
            page_size,
            clone_values,
            include_backups,
            fields,
            all_pages,
            ..Self::default()
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn cache_name(&self) -> Option<&str> {
        self.cache_name.as_deref()
    }

    pub fn query_id(&self) -> i32 {
        self.query_id
    }

    pub fn kind(&self) -> Option<QueryKind> {
        self.kind
    }

    pub fn fields(&self) -> bool {
        self.fields
    }

    pub fn clause(&self) -> Option<&str> {
        self.clause.as_deref()
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    pub fn clause_arguments(&self) -> Option<&[u8]> {
        self.clause_arguments.as_deref()
    }

    pub fn page_size(&self) -> i32 {
        self.page_size
    }

    pub fn clone_values(&self) -> bool {
        self.clone_values
    }

    pub fn include_backups(&self) -> bool {
        self.include_backups
    }

    pub fn is_cancel(&self) -> bool {
        self.cancel
    }

    pub fn single(&self) -> bool {
        self.single
    }

    pub fn include_metadata(&self) -> bool {
        self.include_metadata
    }

    pub fn all_pages(&self) -> bool {
        self.all_pages
    }

    /// Whether this asks for the next page of a query started by an earlier request.
    pub fn is_page_request(&self) -> bool {
        !self.cancel
            && self.kind.is_none()
            && self.clause.is_none()
            && self.class_name.is_none()
            && !self.arguments.is_present()
            && self.code.iter().all(|slot| !slot.is_present())
    }

    pub fn slot(&self, field: CodeField) -> &CodeSlot {
        &self.code[field.index()]
    }

    pub fn arguments_slot(&self) -> &Deferred<Vec<QueryArg>> {
        &self.arguments
    }

    /// Local handle of a slot, without unmarshalling anything.
    pub fn handle(&self, field: CodeField) -> Option<Arc<dyn UserCode>> {
        self.slot(field).handle()
    }

    /// Converts every code handle and the arguments into payloads.
    ///
    /// In deployment-enabled mode the classes involved are recorded on the envelope. Either
    /// every slot is converted or, on error, none is, so a failed call can be retried. Calling
    /// this again after success has no effect.
    pub fn prepare_marshal(&mut self, marshaller: &Marshaller) -> Result<(), MarshalError> {
        if self.marshalled {
            return Ok(());
        }

        let mut deployment = None;
        let mut payloads = Vec::with_capacity(CodeField::COUNT);
        for slot in &self.code {
            payloads.push(slot.marshal_with(|code| {
                marshaller
                    .marshal_code(code.as_ref(), &mut deployment)
                    .map(Some)
            })?);
        }

        let arguments = self.arguments.marshal_with(|args| {
            if args.is_empty() {
                Ok(None)
            } else {
                marshaller.marshal_args(args).map(Some)
            }
        })?;
        let info = deployment.as_ref().map(encode).transpose()?;

        for (slot, payload) in self.code.iter_mut().zip(payloads) {
            if let Some(payload) = payload {
                slot.receive(payload);
            }
        }
        if let Some(payload) = arguments {
            self.arguments.receive(payload);
        }
        if let (Some(bytes), Some(deployment)) = (info, deployment) {
            debug!(
                "request {} ships {} class(es) from {}",
                self.id,
                deployment.classes.len(),
                deployment.origin
            );
            self.envelope.set_deployment(Some(bytes));
        }

        self.marshalled = true;
        Ok(())
    }

    /// Context for rebuilding the handles of a received request.
    pub fn unmarshal_context<'a>(
        &self,
        marshaller: &'a Marshaller,
        resolver: &'a dyn ClassResolver,
    ) -> Result<UnmarshalContext<'a>, MarshalError> {
        if self.marshalled {
            return Err(MarshalError::Outbound);
        }
        UnmarshalContext::new(marshaller, resolver, &self.envelope)
    }

    /// Handle stored in `field`, unmarshalling it on first access.
    pub fn code(
        &self,
        field: CodeField,
        ctx: &UnmarshalContext<'_>,
    ) -> Result<Option<Arc<dyn UserCode>>, MarshalError> {
        if self.marshalled {
            return Err(MarshalError::Outbound);
        }
        self.slot(field)
            .resolve_with(|payload| ctx.unmarshal_code(payload, field.kind()))
    }

    /// Query arguments, unmarshalling them on first access.
    pub fn arguments(
        &self,
        ctx: &UnmarshalContext<'_>,
    ) -> Result<Option<Vec<QueryArg>>, MarshalError> {
        if self.marshalled {
            return Err(MarshalError::Outbound);
        }
        self.arguments
            .resolve_with(|payload| ctx.unmarshal_args(payload))
    }

    /// Rebuilds every handle whose payload was received.
    pub fn finish_unmarshal(
        &self,
        marshaller: &Marshaller,
        resolver: &dyn ClassResolver,
    ) -> Result<(), MarshalError> {
        let ctx = self.unmarshal_context(marshaller, resolver)?;

        for field in CodeField::ALL {
            self.code(field, &ctx)?;
        }
        self.arguments(&ctx)?;
        Ok(())
    }

    fn check_page_size(&self) -> Result<(), CodecError> {
        if self.page_size <= 0 {
            return Err(CodecError::InvalidField {
                message: MESSAGE,
                field: RequestField::PageSize.name(),
                reason: format!("must be positive, got {}", self.page_size),
            });
        }
        Ok(())
    }

    /// Full queries need a kind unless they return fields, and a clause plus a class name
    /// unless they are scans.
    fn check_query(&self) -> Result<(), CodecError> {
        if self.kind.is_none() && !self.fields {
            return Err(Self::missing(RequestField::Kind));
        }

        if self.kind != Some(QueryKind::Scan) {
            if self.clause.is_none() {
                return Err(Self::missing(RequestField::Clause));
            }
            if self.class_name.is_none() && !self.fields {
                return Err(Self::missing(RequestField::ClassName));
            }
        }

        Ok(())
    }

    fn write_slot(
        &self,
        code: CodeField,
        field: RequestField,
        w: &mut Writer<'_>,
    ) -> Result<bool, CodecError> {
        self.code[code.index()].write(w, MESSAGE, field.name())
    }

    fn read_slot(&mut self, code: CodeField, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match r.get_byte_array()? {
            Some(payload) => {
                self.code[code.index()].receive(payload);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn missing(field: RequestField) -> CodecError {
        CodecError::MissingField {
            message: MESSAGE,
            field: field.name(),
        }
    }
}

macro_rules! read_into {
    ($read:expr => $target:expr) => {
        match $read? {
            Some(value) => {
                $target = value;
                Ok(true)
            }
            None => Ok(false),
        }
    };
}

impl Message for QueryRequest {
    type Field = RequestField;

    const TYPE: MessageType = MessageType::QueryRequest;
    const FIELDS: &'static [RequestField] = &REQUEST_FIELDS;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn write_field(&self, field: RequestField, w: &mut Writer<'_>) -> Result<bool, CodecError> {
        match field {
            RequestField::AfterCallback => self.write_slot(CodeField::AfterCallback, field, w),
            RequestField::BeforeCallback => self.write_slot(CodeField::BeforeCallback, field, w),
            RequestField::FieldsReducer => self.write_slot(CodeField::FieldsReducer, field, w),
            RequestField::KeyFilter => self.write_slot(CodeField::KeyFilter, field, w),
            RequestField::ProjectionFilter => self.write_slot(CodeField::ProjectionFilter, field, w),
            RequestField::Reducer => self.write_slot(CodeField::Reducer, field, w),
            RequestField::Transformer => self.write_slot(CodeField::Transformer, field, w),
            RequestField::ValueFilter => self.write_slot(CodeField::ValueFilter, field, w),
            RequestField::Visitor => self.write_slot(CodeField::Visitor, field, w),
            RequestField::AllPages => w.put_bool(self.all_pages),
            RequestField::Arguments => self.arguments.write(w, MESSAGE, field.name()),
            RequestField::ClauseArguments => w.put_byte_array(self.clause_arguments.as_deref()),
            RequestField::CacheName => w.put_string(self.cache_name.as_deref()),
            RequestField::Cancel => w.put_bool(self.cancel),
            RequestField::Clause => w.put_string(self.clause.as_deref()),
            RequestField::CloneValues => w.put_bool(self.clone_values),
            RequestField::ClassName => w.put_string(self.class_name.as_deref()),
            RequestField::Fields => w.put_bool(self.fields),
            RequestField::Id => w.put_long(self.id),
            RequestField::IncludeBackups => w.put_bool(self.include_backups),
            RequestField::IncludeMetadata => w.put_bool(self.include_metadata),
            RequestField::PageSize => w.put_int(self.page_size),
            RequestField::QueryId => w.put_int(self.query_id),
            RequestField::Single => w.put_bool(self.single),
            RequestField::Kind => w.put_enum(self.kind),
        }
    }

    fn read_field(&mut self, field: RequestField, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match field {
            RequestField::AfterCallback => self.read_slot(CodeField::AfterCallback, r),
            RequestField::BeforeCallback => self.read_slot(CodeField::BeforeCallback, r),
            RequestField::FieldsReducer => self.read_slot(CodeField::FieldsReducer, r),
            RequestField::KeyFilter => self.read_slot(CodeField::KeyFilter, r),
            RequestField::ProjectionFilter => self.read_slot(CodeField::ProjectionFilter, r),
            RequestField::Reducer => self.read_slot(CodeField::Reducer, r),
            RequestField::Transformer => self.read_slot(CodeField::Transformer, r),
            RequestField::ValueFilter => self.read_slot(CodeField::ValueFilter, r),
            RequestField::Visitor => self.read_slot(CodeField::Visitor, r),
            RequestField::AllPages => read_into!(r.get_bool() => self.all_pages),
            RequestField::Arguments => match r.get_byte_array()? {
                Some(payload) => {
                    self.arguments.receive(payload);
                    Ok(true)
                }
                None => Ok(false),
            },
            RequestField::ClauseArguments => read_into!(r.get_byte_array() => self.clause_arguments),
            RequestField::CacheName => read_into!(r.get_string() => self.cache_name),
            RequestField::Cancel => read_into!(r.get_bool() => self.cancel),
            RequestField::Clause => read_into!(r.get_string() => self.clause),
            RequestField::CloneValues => read_into!(r.get_bool() => self.clone_values),
            RequestField::ClassName => read_into!(r.get_string() => self.class_name),
            RequestField::Fields => read_into!(r.get_bool() => self.fields),
            RequestField::Id => read_into!(r.get_long() => self.id),
            RequestField::IncludeBackups => read_into!(r.get_bool() => self.include_backups),
            RequestField::IncludeMetadata => read_into!(r.get_bool() => self.include_metadata),
            RequestField::PageSize => read_into!(r.get_int() => self.page_size),
            RequestField::QueryId => read_into!(r.get_int() => self.query_id),
            RequestField::Single => read_into!(r.get_bool() => self.single),
            RequestField::Kind => read_into!(r.get_enum() => self.kind),
        }
    }

    /// A cancel needs nothing but its id; every other request needs a positive page size.
    /// A decoded request without query parameters is taken as a page request, the rest must
    /// pass `check_query`.
    fn validate(&self) -> Result<(), CodecError> {
        if self.cancel {
            return Ok(());
        }

        self.check_page_size()?;
        if self.is_page_request() {
            return Ok(());
        }
        self.check_query()
    }
}

/// Assembles a full query request.
#[derive(Debug, Clone)]
pub struct QueryRequestBuilder {
    request: QueryRequest,
}

impl QueryRequestBuilder {
    pub fn query_id(mut self, query_id: i32) -> Self {
        self.request.query_id = query_id;
        self
    }

    pub fn kind(mut self, kind: QueryKind) -> Self {
        self.request.kind = Some(kind);
        self
    }

    pub fn fields(mut self, fields: bool) -> Self {
        self.request.fields = fields;
        self
    }

    pub fn clause(mut self, clause: impl Into<String>) -> Self {
        self.request.clause = Some(clause.into());
        self
    }

    pub fn class_name(mut self, class_name: impl Into<String>) -> Self {
        self.request.class_name = Some(class_name.into());
        self
    }

    pub fn code(mut self, field: CodeField, code: Arc<dyn UserCode>) -> Self {
        self.request.code[field.index()] = Deferred::resolved(code);
        self
    }

    pub fn key_filter(self, code: Arc<dyn UserCode>) -> Self {
        self.code(CodeField::KeyFilter, code)
    }

    pub fn value_filter(self, code: Arc<dyn UserCode>) -> Self {
        self.code(CodeField::ValueFilter, code)
    }

    pub fn reducer(self, code: Arc<dyn UserCode>) -> Self {
        self.code(CodeField::Reducer, code)
    }

    pub fn transformer(self, code: Arc<dyn UserCode>) -> Self {
        self.code(CodeField::Transformer, code)
    }

    pub fn arguments(mut self, args: Vec<QueryArg>) -> Self {
        self.request.arguments = Deferred::resolved(args);
        self
    }

    pub fn clause_arguments(mut self, payload: Vec<u8>) -> Self {
        self.request.clause_arguments = Some(payload);
        self
    }

    pub fn page_size(mut self, page_size: i32) -> Self {
        self.request.page_size = page_size;
        self
    }

    pub fn clone_values(mut self, clone_values: bool) -> Self {
        self.request.clone_values = clone_values;
        self
    }

    pub fn include_backups(mut self, include_backups: bool) -> Self {
        self.request.include_backups = include_backups;
        self
    }

    pub fn single(mut self, single: bool) -> Self {
        self.request.single = single;
        self
    }

    pub fn include_metadata(mut self, include_metadata: bool) -> Self {
        self.request.include_metadata = include_metadata;
        self
    }

    pub fn all_pages(mut self, all_pages: bool) -> Self {
        self.request.all_pages = all_pages;
        self
    }

    /// Validates as a full query; the page-request shape is only reachable through
    /// [`QueryRequest::page_request`].
    pub fn build(self) -> Result<QueryRequest, CodecError> {
        self.request.check_page_size()?;
        self.request.check_query()?;
        Ok(self.request)
    }
}
